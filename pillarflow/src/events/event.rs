//! Typed lifecycle events.

use crate::core::{CheckpointDecision, StageId};
use crate::errors::{RunFailure, StageErrorDetail};
use crate::resilience::CircuitState;
use crate::utils::RunId;
use serde::{Deserialize, Serialize};

/// An observable state change in the orchestrator.
///
/// Events are grouped by their dotted type prefix: `run.*`, `stage.*`,
/// `checkpoint.*`, `circuit.*` and `limiter.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A new run was persisted and started.
    RunStarted {
        /// The run.
        run_id: RunId,
        /// Pipeline name.
        pipeline: String,
    },
    /// A stored run was picked up again.
    RunResumed {
        /// The run.
        run_id: RunId,
        /// Stages already recorded when resuming.
        recorded_stages: usize,
    },
    /// The run paused on one or more checkpoints.
    RunAwaitingApproval {
        /// The run.
        run_id: RunId,
        /// Checkpoints waiting for a decision.
        stages: Vec<StageId>,
    },
    /// The run completed with a composite score.
    RunCompleted {
        /// The run.
        run_id: RunId,
        /// The gravity index.
        gravity_index: f64,
    },
    /// The run failed.
    RunFailed {
        /// The run.
        run_id: RunId,
        /// Why.
        failure: RunFailure,
    },
    /// The run was cancelled.
    RunCancelled {
        /// The run.
        run_id: RunId,
        /// Reason given by the caller.
        reason: String,
    },
    /// A stage attempt started.
    StageStarted {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A stage attempt failed and will be retried after a delay.
    StageRetrying {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// The attempt that failed.
        attempt: u32,
        /// Backoff before the next attempt.
        delay_ms: u64,
        /// Why the attempt failed.
        error: StageErrorDetail,
    },
    /// A stage succeeded.
    StageSucceeded {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// Attempts used.
        attempts: usize,
    },
    /// A stage failed for good.
    StageFailed {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// Attempts used.
        attempts: usize,
        /// The last error.
        error: StageErrorDetail,
    },
    /// A skippable stage failed and was degraded.
    StageSkipped {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// The error that caused the skip.
        error: StageErrorDetail,
    },
    /// A stage failed for good and its fallback output was used instead.
    StageFallback {
        /// The run.
        run_id: RunId,
        /// The stage.
        stage_id: StageId,
        /// The failure the fallback replaced.
        error: StageErrorDetail,
    },
    /// A checkpoint received a decision.
    CheckpointDecided {
        /// The run.
        run_id: RunId,
        /// The checkpoint stage.
        stage_id: StageId,
        /// The decision.
        decision: CheckpointDecision,
    },
    /// A stage's circuit changed state.
    CircuitTransition {
        /// The stage whose circuit moved.
        stage_id: StageId,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
    /// The adaptive concurrency limit changed.
    LimiterAdjusted {
        /// Previous limit.
        from: usize,
        /// New limit.
        to: usize,
    },
}

impl PipelineEvent {
    /// Returns the dotted event type (e.g., "stage.retrying").
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::RunResumed { .. } => "run.resumed",
            Self::RunAwaitingApproval { .. } => "run.awaiting_approval",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCancelled { .. } => "run.cancelled",
            Self::StageStarted { .. } => "stage.started",
            Self::StageRetrying { .. } => "stage.retrying",
            Self::StageSucceeded { .. } => "stage.succeeded",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageSkipped { .. } => "stage.skipped",
            Self::StageFallback { .. } => "stage.fallback",
            Self::CheckpointDecided { .. } => "checkpoint.decided",
            Self::CircuitTransition { to, .. } => match to {
                CircuitState::Open => "circuit.opened",
                CircuitState::HalfOpen => "circuit.half_opened",
                CircuitState::Closed => "circuit.closed",
            },
            Self::LimiterAdjusted { .. } => "limiter.adjusted",
        }
    }

    /// Returns the run the event belongs to, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::RunAwaitingApproval { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageRetrying { run_id, .. }
            | Self::StageSucceeded { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::StageSkipped { run_id, .. }
            | Self::StageFallback { run_id, .. }
            | Self::CheckpointDecided { run_id, .. } => Some(*run_id),
            Self::CircuitTransition { .. } | Self::LimiterAdjusted { .. } => None,
        }
    }
}
