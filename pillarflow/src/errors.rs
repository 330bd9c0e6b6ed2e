//! Error types for pillarflow.
//!
//! Every failure the orchestration core can produce is represented here:
//! registry validation, stage operations, persistence, aggregation, the
//! terminal failure recorded on a run, and the control-surface errors
//! returned by the orchestrator.

use crate::core::{AttemptRecord, RunStatus, StageResult};
use crate::utils::RunId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Structured diagnostic attached to validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiagnosticInfo {
    /// Stable error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl DiagnosticInfo {
    /// Creates a new diagnostic.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised while building or validating a stage registry.
///
/// Registries are validated once, at construction time. A registry that
/// builds successfully can never produce one of these at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// The stages forming the cycle, first stage repeated at the end.
        path: Vec<String>,
    },

    /// A stage depends on a stage that is not registered.
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The declaring stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The same stage id was registered twice.
    #[error("stage '{stage}' is declared more than once")]
    Duplicate {
        /// The duplicated id.
        stage: String,
    },

    /// A stage id or declaration is malformed.
    #[error("stage '{stage}' is malformed: {reason}")]
    Malformed {
        /// The offending stage id.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A retry, circuit or timeout policy is out of range.
    #[error("stage '{stage}' has an invalid {policy} policy: {reason}")]
    Policy {
        /// The offending stage id.
        stage: String,
        /// Which policy failed validation.
        policy: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The registry declares no stages at all.
    #[error("pipeline '{pipeline}' declares no stages")]
    Empty {
        /// The pipeline name.
        pipeline: String,
    },
}

impl ValidationError {
    /// Returns the stable diagnostic code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "PIPELINE-CYCLE",
            Self::UnknownDependency { .. } => "PIPELINE-MISSING_DEP",
            Self::Duplicate { .. } => "PIPELINE-DUPLICATE",
            Self::Malformed { .. } => "PIPELINE-MALFORMED",
            Self::Policy { .. } => "PIPELINE-POLICY",
            Self::Empty { .. } => "PIPELINE-EMPTY",
        }
    }

    /// Builds a diagnostic with a fix hint for this error.
    #[must_use]
    pub fn diagnostic(&self) -> DiagnosticInfo {
        let info = DiagnosticInfo::new(self.code(), self.to_string());
        match self {
            Self::Cycle { path } => info
                .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
                .with_context_entry("cycle", path.join(" -> ")),
            Self::UnknownDependency { stage, dependency } => info
                .with_fix_hint("Register the dependency or check the stage id for typos.")
                .with_context_entry("stage", stage.clone())
                .with_context_entry("dependency", dependency.clone()),
            Self::Duplicate { stage } => info
                .with_fix_hint("Give every stage a unique id.")
                .with_context_entry("stage", stage.clone()),
            Self::Malformed { stage, .. } => info
                .with_fix_hint("Stage ids are lowercase ascii: [a-z][a-z0-9_-]*.")
                .with_context_entry("stage", stage.clone()),
            Self::Policy { stage, policy, .. } => info
                .with_context_entry("stage", stage.clone())
                .with_context_entry("policy", policy.clone()),
            Self::Empty { .. } => info.with_fix_hint("Add at least one stage before building."),
        }
    }

    pub(crate) fn policy(
        stage: impl Into<String>,
        policy: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Policy {
            stage: stage.into(),
            policy: policy.to_string(),
            reason: reason.into(),
        }
    }
}

/// Error returned by a stage operation.
///
/// Operations classify their own failures: `Transient` failures are retried
/// by the resilience wrapper, `Fatal` ones stop the stage immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum OperationError {
    /// A failure that may succeed on retry (rate limit, network blip).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure that will not succeed on retry.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl OperationError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns true if the failure may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns the error message without its classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }
}

/// Classification of a failed stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The operation reported a transient failure.
    Transient,
    /// The operation reported a fatal failure.
    Fatal,
    /// The attempt exceeded its timeout.
    Timeout,
    /// The stage's circuit was open; the operation was not called.
    CircuitOpen,
    /// The invocation was cancelled.
    Cancelled,
}

impl StageErrorKind {
    /// Returns true if another attempt may follow this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// Returns true if this failure is a capacity signal for the limiter.
    #[must_use]
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::Timeout | Self::CircuitOpen)
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
            Self::Timeout => write!(f, "timeout"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error detail carried by a failed attempt or a failed stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrorDetail {
    /// The failure classification.
    pub kind: StageErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl StageErrorDetail {
    /// Creates a new error detail.
    #[must_use]
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout detail.
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            StageErrorKind::Timeout,
            format!("attempt timed out after {}ms", after.as_millis()),
        )
    }

    /// Creates a circuit-open detail.
    #[must_use]
    pub fn circuit_open(stage_id: &str) -> Self {
        Self::new(
            StageErrorKind::CircuitOpen,
            format!("circuit for stage '{stage_id}' is open"),
        )
    }
}

impl From<&OperationError> for StageErrorDetail {
    fn from(err: &OperationError) -> Self {
        let kind = match err {
            OperationError::Transient(_) => StageErrorKind::Transient,
            OperationError::Fatal(_) => StageErrorKind::Fatal,
        };
        Self::new(kind, err.message())
    }
}

impl fmt::Display for StageErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error raised by a checkpoint store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No record exists for the run.
    #[error("run {0} not found in checkpoint store")]
    NotFound(RunId),

    /// A different result was already recorded for the stage.
    #[error("conflicting result for stage '{stage}' in run {run_id}")]
    Conflict {
        /// The run.
        run_id: RunId,
        /// The stage whose result conflicts.
        stage: String,
    },

    /// Underlying storage I/O failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record failed its integrity check.
    #[error("checkpoint record is corrupted: {0}")]
    Corrupted(String),
}

/// Raised when a run status change would break the run lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run status transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// The current status.
    pub from: RunStatus,
    /// The rejected target status.
    pub to: RunStatus,
}

/// Error raised when combining stage outputs into a composite score.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    /// Non-skippable stages have no successful result.
    #[error("run is incomplete; no successful result for: {}", missing.join(", "))]
    IncompleteRun {
        /// Every stage missing a successful result, in declaration order.
        missing: Vec<String>,
    },

    /// A stage output does not match its declared schema.
    #[error("output of stage '{stage}' violates its schema: {reason}")]
    SchemaViolation {
        /// The offending stage.
        stage: String,
        /// What did not match.
        reason: String,
    },

    /// None of the successful stages produced a score.
    #[error("no stage produced a score to aggregate")]
    NoScore,

    /// The configured weights cannot be normalized.
    #[error("invalid aggregation weights: {0}")]
    InvalidWeights(String),
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailureKind {
    /// A non-skippable stage exhausted its attempts or failed fatally.
    StageFailed,
    /// A checkpoint was rejected.
    CheckpointRejected,
    /// A checkpoint was not decided before the approval timeout.
    ApprovalTimedOut,
    /// The checkpoint store failed.
    Persistence,
    /// The aggregator rejected the completed results.
    Aggregation,
    /// An internal invariant was violated.
    Internal,
}

impl fmt::Display for RunFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageFailed => write!(f, "stage_failed"),
            Self::CheckpointRejected => write!(f, "checkpoint_rejected"),
            Self::ApprovalTimedOut => write!(f, "approval_timed_out"),
            Self::Persistence => write!(f, "persistence"),
            Self::Aggregation => write!(f, "aggregation"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Terminal failure recorded on a `Failed` run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RunFailure {
    /// Failure classification.
    pub kind: RunFailureKind,
    /// The stage responsible, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Attempt history of the failed stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl RunFailure {
    fn new(kind: RunFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage_id: None,
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    /// Failure caused by a stage result that could not be degraded.
    #[must_use]
    pub fn stage_failed(result: &StageResult) -> Self {
        let message = result
            .error
            .as_ref()
            .map_or_else(|| "stage failed".to_string(), ToString::to_string);
        Self {
            kind: RunFailureKind::StageFailed,
            stage_id: Some(result.stage_id.clone()),
            message,
            attempts: result.attempts.clone(),
        }
    }

    /// Failure caused by a rejected checkpoint.
    #[must_use]
    pub fn checkpoint_rejected(stage_id: &str, annotation: Option<&str>) -> Self {
        let message = match annotation {
            Some(note) => format!("checkpoint '{stage_id}' rejected: {note}"),
            None => format!("checkpoint '{stage_id}' rejected"),
        };
        let mut failure = Self::new(RunFailureKind::CheckpointRejected, message);
        failure.stage_id = Some(stage_id.to_string());
        failure
    }

    /// Failure caused by a checkpoint left undecided for too long.
    #[must_use]
    pub fn approval_timed_out(stage_ids: &[String], after: Duration) -> Self {
        let mut failure = Self::new(
            RunFailureKind::ApprovalTimedOut,
            format!(
                "no decision for checkpoint(s) {} within {}s",
                stage_ids.join(", "),
                after.as_secs()
            ),
        );
        failure.stage_id = stage_ids.first().cloned();
        failure
    }

    /// Failure caused by the checkpoint store.
    #[must_use]
    pub fn persistence(err: &PersistenceError) -> Self {
        Self::new(RunFailureKind::Persistence, err.to_string())
    }

    /// Failure raised by the aggregator.
    #[must_use]
    pub fn aggregation(err: &AggregationError) -> Self {
        Self::new(RunFailureKind::Aggregation, err.to_string())
    }

    /// Failure caused by a broken internal invariant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RunFailureKind::Internal, message)
    }
}

/// Error raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The file.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the config schema.
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidOverride {
        /// The environment variable.
        key: String,
        /// Its value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The resulting configuration is out of range.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Error returned by the orchestrator control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The run is neither live nor stored.
    #[error("run {0} not found")]
    RunNotFound(RunId),

    /// The run already reached a terminal status.
    #[error("run {run_id} is already {status}")]
    RunTerminal {
        /// The run.
        run_id: RunId,
        /// Its terminal status.
        status: RunStatus,
    },

    /// The stage is not a checkpoint waiting for a decision.
    #[error("stage '{stage}' of run {run_id} is not awaiting approval")]
    NotAwaitingApproval {
        /// The run.
        run_id: RunId,
        /// The stage named in the decision.
        stage: String,
    },

    /// The run is already being driven by this orchestrator.
    #[error("run {0} is already active")]
    AlreadyActive(RunId),

    /// The run was stored for a different pipeline.
    #[error("run {run_id} belongs to pipeline '{found}', not '{expected}'")]
    PipelineMismatch {
        /// The run.
        run_id: RunId,
        /// Pipeline served by this orchestrator.
        expected: String,
        /// Pipeline recorded on the run.
        found: String,
    },

    /// The run ended in `Failed`.
    #[error("run {run_id} failed: {failure}")]
    RunFailed {
        /// The run.
        run_id: RunId,
        /// The recorded failure.
        failure: RunFailure,
    },

    /// The run's driver task stopped without reaching a terminal status.
    #[error("driver for run {0} stopped unexpectedly")]
    DriverStopped(RunId),

    /// The checkpoint store failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
