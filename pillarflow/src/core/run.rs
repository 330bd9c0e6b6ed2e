//! The persisted pipeline run record.

use super::{RunStatus, StageId, StageResult};
use crate::aggregate::CompositeScore;
use crate::errors::{InvalidTransition, PersistenceError, RunFailure};
use crate::utils::{now_utc, RunId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Decision taken on a checkpoint stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    /// Dependents of the checkpoint may proceed.
    Approved,
    /// The run fails.
    Rejected,
}

impl fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A recorded checkpoint decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// The checkpoint stage.
    pub stage_id: StageId,
    /// The decision.
    pub decision: CheckpointDecision,
    /// Free-form note supplied with the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// When the decision was recorded.
    pub decided_at: Timestamp,
}

/// One execution of a pipeline.
///
/// The result log is append-only with at most one entry per stage, and the
/// status only moves forward (apart from `AwaitingApproval -> Running`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id.
    pub id: RunId,
    /// Name of the pipeline that produced this run.
    pub pipeline: String,
    /// The pipeline input handed to every stage.
    pub input: Value,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Stage results in the order they were recorded.
    #[serde(default)]
    pub results: Vec<StageResult>,
    /// Checkpoint decisions in the order they were recorded.
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    /// Composite score, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeScore>,
    /// Terminal failure, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Reason given for cancellation, once cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last change.
    pub updated_at: Timestamp,
}

impl PipelineRun {
    /// Creates a new `Pending` run.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, input: Value) -> Self {
        let now = now_utc();
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            input,
            status: RunStatus::Pending,
            results: Vec::new(),
            approvals: Vec::new(),
            composite: None,
            failure: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the run to `next`, refusing transitions the lifecycle forbids.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        self.status = self.status.transition(next)?;
        self.touch();
        Ok(())
    }

    /// Marks the run completed with its composite score.
    pub fn complete(&mut self, composite: CompositeScore) -> Result<(), InvalidTransition> {
        self.transition(RunStatus::Completed)?;
        self.composite = Some(composite);
        Ok(())
    }

    /// Marks the run failed.
    pub fn fail(&mut self, failure: RunFailure) -> Result<(), InvalidTransition> {
        self.transition(RunStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Marks the run cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(RunStatus::Cancelled)?;
        self.cancel_reason = Some(reason.into());
        Ok(())
    }

    /// Returns true if the run reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the recorded result of `stage_id`.
    #[must_use]
    pub fn result_for(&self, stage_id: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage_id == stage_id)
    }

    /// Appends a stage result.
    ///
    /// Returns `Ok(true)` when appended and `Ok(false)` when an identical
    /// result was already present. A different result for the same stage is
    /// a [`PersistenceError::Conflict`].
    pub fn append_result(&mut self, result: StageResult) -> Result<bool, PersistenceError> {
        match self.result_for(&result.stage_id) {
            Some(existing) if *existing == result => Ok(false),
            Some(_) => Err(PersistenceError::Conflict {
                run_id: self.id,
                stage: result.stage_id,
            }),
            None => {
                self.results.push(result);
                self.touch();
                Ok(true)
            }
        }
    }

    /// Records a checkpoint decision.
    pub fn record_decision(&mut self, record: ApprovalRecord) {
        self.approvals.push(record);
        self.touch();
    }

    /// Returns the decision taken on `stage_id`, if any.
    #[must_use]
    pub fn decision_for(&self, stage_id: &str) -> Option<CheckpointDecision> {
        self.approvals
            .iter()
            .find(|a| a.stage_id == stage_id)
            .map(|a| a.decision)
    }

    /// Builds a summary, given the checkpoints currently waiting.
    #[must_use]
    pub fn summary(&self, awaiting_approval: Vec<StageId>) -> RunSummary {
        RunSummary {
            id: self.id,
            pipeline: self.pipeline.clone(),
            status: self.status,
            completed_stages: self.results.iter().map(|r| r.stage_id.clone()).collect(),
            fallback_stages: self
                .results
                .iter()
                .filter(|r| r.fallback)
                .map(|r| r.stage_id.clone())
                .collect(),
            awaiting_approval,
            gravity_index: self.composite.as_ref().map(|c| c.gravity_index),
            failure: self.failure.clone(),
            cancel_reason: self.cancel_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}

/// Lightweight view of a run returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id.
    pub id: RunId,
    /// Pipeline name.
    pub pipeline: String,
    /// Current status.
    pub status: RunStatus,
    /// Stages with a recorded result, in recording order.
    pub completed_stages: Vec<StageId>,
    /// Recorded stages whose output came from a fallback.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_stages: Vec<StageId>,
    /// Checkpoints waiting for a decision.
    pub awaiting_approval: Vec<StageId>,
    /// Gravity index, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gravity_index: Option<f64>,
    /// Terminal failure, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Cancellation reason, once cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last change.
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutput;
    use serde_json::json;

    fn result(stage: &str, score: f64) -> StageResult {
        let now = now_utc();
        StageResult::succeeded(stage, StageOutput::score(score), Vec::new(), now, now)
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = PipelineRun::new("gravity", json!({"brand": "acme"}));
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.results.is_empty());
        assert_eq!(run.created_at, run.updated_at);
    }

    #[test]
    fn test_append_result_is_idempotent() {
        let mut run = PipelineRun::new("gravity", json!({}));
        let r = result("strategy", 0.5);

        assert!(run.append_result(r.clone()).unwrap());
        assert!(!run.append_result(r).unwrap());
        assert_eq!(run.results.len(), 1);
    }

    #[test]
    fn test_append_conflicting_result_is_rejected() {
        let mut run = PipelineRun::new("gravity", json!({}));
        run.append_result(result("strategy", 0.5)).unwrap();

        let err = run.append_result(result("strategy", 0.6)).unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { ref stage, .. } if stage == "strategy"));
        assert_eq!(run.results.len(), 1);
    }

    #[test]
    fn test_terminal_helpers() {
        let mut run = PipelineRun::new("gravity", json!({}));
        run.transition(RunStatus::Running).unwrap();
        run.cancel("operator request").unwrap();

        assert!(run.is_terminal());
        assert_eq!(run.cancel_reason.as_deref(), Some("operator request"));
        assert!(run.fail(RunFailure::internal("late")).is_err());
        assert!(run.failure.is_none());
    }

    #[test]
    fn test_decisions() {
        let mut run = PipelineRun::new("gravity", json!({}));
        assert_eq!(run.decision_for("design"), None);

        run.record_decision(ApprovalRecord {
            stage_id: "design".into(),
            decision: CheckpointDecision::Approved,
            annotation: Some("looks right".into()),
            decided_at: now_utc(),
        });
        assert_eq!(run.decision_for("design"), Some(CheckpointDecision::Approved));
    }

    #[test]
    fn test_summary() {
        let mut run = PipelineRun::new("gravity", json!({}));
        run.append_result(result("strategy", 0.5)).unwrap();

        let summary = run.summary(vec!["design".into()]);
        assert_eq!(summary.completed_stages, vec!["strategy".to_string()]);
        assert_eq!(summary.awaiting_approval, vec!["design".to_string()]);
        assert_eq!(summary.gravity_index, None);
        assert!(summary.fallback_stages.is_empty());
    }

    #[test]
    fn test_summary_lists_fallback_stages() {
        let mut run = PipelineRun::new("gravity", json!({}));
        let now = now_utc();
        let rescued = StageResult::failed(
            "technology",
            crate::errors::StageErrorDetail::new(crate::errors::StageErrorKind::Fatal, "quota"),
            Vec::new(),
            now,
            now,
        )
        .into_fallback(StageOutput::score(0.3), now);
        run.append_result(result("strategy", 0.5)).unwrap();
        run.append_result(rescued).unwrap();

        let summary = run.summary(Vec::new());
        assert_eq!(summary.completed_stages.len(), 2);
        assert_eq!(summary.fallback_stages, vec!["technology".to_string()]);
    }
}
