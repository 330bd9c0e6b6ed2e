//! Checkpoint decisions.

use crate::core::{ApprovalRecord, CheckpointDecision, PipelineRun, StageId};
use crate::errors::{OrchestratorError, RunFailure};
use crate::pipeline::StageRegistry;
use crate::utils::now_utc;
use tokio::sync::oneshot;

/// A decision submitted for a checkpoint stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    /// The checkpoint stage.
    pub stage_id: StageId,
    /// Approve or reject.
    pub decision: CheckpointDecision,
    /// Optional note kept with the decision.
    pub annotation: Option<String>,
}

impl ApprovalRequest {
    /// Creates an approval.
    #[must_use]
    pub fn approve(stage_id: impl Into<StageId>) -> Self {
        Self {
            stage_id: stage_id.into(),
            decision: CheckpointDecision::Approved,
            annotation: None,
        }
    }

    /// Creates a rejection.
    #[must_use]
    pub fn reject(stage_id: impl Into<StageId>) -> Self {
        Self {
            stage_id: stage_id.into(),
            decision: CheckpointDecision::Rejected,
            annotation: None,
        }
    }

    /// Attaches a note.
    #[must_use]
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

/// A request sent to a run's driver, with a channel for the verdict.
#[derive(Debug)]
pub(crate) struct ApprovalCommand {
    pub(crate) request: ApprovalRequest,
    pub(crate) reply: oneshot::Sender<Result<(), OrchestratorError>>,
}

/// What a recorded decision means for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecisionEffect {
    /// Dependents of the checkpoint may proceed.
    Proceed,
    /// The run must fail.
    Reject(RunFailure),
}

/// Records `request` on `run` after checking the stage is waiting for it.
///
/// # Errors
///
/// [`OrchestratorError::RunTerminal`] for a finished run and
/// [`OrchestratorError::NotAwaitingApproval`] when the stage is not a
/// checkpoint that succeeded and has no decision yet.
pub(crate) fn apply_decision(
    registry: &StageRegistry,
    run: &mut PipelineRun,
    request: &ApprovalRequest,
) -> Result<DecisionEffect, OrchestratorError> {
    if run.is_terminal() {
        return Err(OrchestratorError::RunTerminal {
            run_id: run.id,
            status: run.status,
        });
    }
    if !registry.awaiting_approval(run).contains(&request.stage_id) {
        return Err(OrchestratorError::NotAwaitingApproval {
            run_id: run.id,
            stage: request.stage_id.clone(),
        });
    }

    run.record_decision(ApprovalRecord {
        stage_id: request.stage_id.clone(),
        decision: request.decision,
        annotation: request.annotation.clone(),
        decided_at: now_utc(),
    });

    Ok(match request.decision {
        CheckpointDecision::Approved => DecisionEffect::Proceed,
        CheckpointDecision::Rejected => DecisionEffect::Reject(RunFailure::checkpoint_rejected(
            &request.stage_id,
            request.annotation.as_deref(),
        )),
    })
}
