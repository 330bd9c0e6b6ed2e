//! Stage specifications.

use super::{RetryPolicy, StageOperation};
use crate::core::{OutputSchema, StageId};
use crate::errors::ValidationError;
use crate::resilience::CircuitPolicy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Pattern every stage id must match.
pub const STAGE_ID_PATTERN: &str = r"^[a-z][a-z0-9_-]*$";

/// Maximum length of a stage id.
pub const STAGE_ID_MAX_LEN: usize = 64;

/// Per-attempt timeout applied when a stage does not set one.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

#[allow(clippy::expect_used)]
static STAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(STAGE_ID_PATTERN).expect("stage id pattern is valid"));

/// Specification for a single stage of a pipeline.
///
/// A spec is immutable once registered. Dependencies keep their declaration
/// order so that dependency outputs and diagnostics are deterministic.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique stage id.
    pub id: StageId,
    /// Ids of the stages this stage depends on.
    pub dependencies: Vec<StageId>,
    /// Whether dependents wait for an external approval after success.
    pub checkpoint: bool,
    /// Whether an exhausted failure degrades to `Skipped`.
    pub skippable: bool,
    /// Timeout applied to each attempt.
    pub timeout: Duration,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Circuit breaker parameters for this stage.
    pub circuit: CircuitPolicy,
    /// Schema the output must satisfy at aggregation.
    pub schema: OutputSchema,
    /// Weight of this stage in the composite score.
    pub weight: f64,
    /// The operation to run.
    pub operation: Arc<dyn StageOperation>,
    /// Invoked once when `operation` fails for good; its output stands in
    /// for the stage's.
    pub fallback: Option<Arc<dyn StageOperation>>,
}

impl StageSpec {
    /// Creates a new stage specification with default policies.
    #[must_use]
    pub fn new(id: impl Into<StageId>, operation: Arc<dyn StageOperation>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            checkpoint: false,
            skippable: false,
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry: RetryPolicy::model_inference(),
            circuit: CircuitPolicy::default(),
            schema: OutputSchema::Any,
            weight: 1.0,
            operation,
            fallback: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies<S: Into<StageId>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<StageId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Marks the stage as a checkpoint.
    #[must_use]
    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Marks the stage as skippable.
    #[must_use]
    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit policy.
    #[must_use]
    pub fn with_circuit(mut self, circuit: CircuitPolicy) -> Self {
        self.circuit = circuit;
        self
    }

    /// Sets the output schema.
    #[must_use]
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the operation used when the stage fails for good.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn StageOperation>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Sets the aggregation weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Validates everything that can be checked without the other stages.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed id, a self or repeated dependency, or
    /// an out-of-range policy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_stage_id(&self.id)?;

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if *dep == self.id {
                return Err(ValidationError::Cycle {
                    path: vec![self.id.clone(), self.id.clone()],
                });
            }
            if !seen.insert(dep.as_str()) {
                return Err(ValidationError::Malformed {
                    stage: self.id.clone(),
                    reason: format!("dependency '{dep}' is listed more than once"),
                });
            }
        }

        if self.timeout.is_zero() {
            return Err(ValidationError::policy(&self.id, "timeout", "timeout must be positive"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(ValidationError::policy(
                &self.id,
                "weight",
                format!("weight must be finite and non-negative, got {}", self.weight),
            ));
        }
        self.retry.validate(&self.id)?;
        self.circuit.validate(&self.id)
    }
}

/// Checks a stage id against [`STAGE_ID_PATTERN`] and [`STAGE_ID_MAX_LEN`].
///
/// # Errors
///
/// Returns [`ValidationError::Malformed`] describing the problem.
pub fn validate_stage_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > STAGE_ID_MAX_LEN {
        return Err(ValidationError::Malformed {
            stage: id.to_string(),
            reason: format!("id exceeds {STAGE_ID_MAX_LEN} characters"),
        });
    }
    if !STAGE_ID_RE.is_match(id) {
        return Err(ValidationError::Malformed {
            stage: id.to_string(),
            reason: format!("id must match {STAGE_ID_PATTERN}"),
        });
    }
    Ok(())
}
