//! Stage and run status enums.

use crate::errors::InvalidTransition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final status of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The operation produced an output.
    Succeeded,
    /// The stage failed after exhausting its attempts, or fatally.
    Failed,
    /// A skippable stage failed and was degraded.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Lifecycle status of a pipeline run.
///
/// ```text
/// Pending -> Running <-> AwaitingApproval
///    |          |              |
///    v          v              v
/// Cancelled   Completed | Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created and persisted, not yet dispatching.
    Pending,
    /// Dispatching stages.
    Running,
    /// At least one checkpoint is waiting for a decision.
    AwaitingApproval,
    /// All stages finished and the composite score was computed.
    Completed,
    /// The run failed; see its failure record.
    Failed,
    /// The run was cancelled externally.
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => matches!(
                next,
                Self::AwaitingApproval | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::AwaitingApproval => {
                matches!(next, Self::Running | Self::Failed | Self::Cancelled)
            }
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Checks a transition, returning the error the run would raise.
    pub fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_run_status_serialize() {
        let json = serde_json::to_string(&RunStatus::AwaitingApproval).unwrap();
        assert_eq!(json, r#""awaiting_approval""#);

        let back: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RunStatus::AwaitingApproval);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::AwaitingApproval,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_no_status_reenters_pending() {
        for from in [RunStatus::Pending, RunStatus::Running, RunStatus::AwaitingApproval] {
            assert!(!from.can_transition_to(RunStatus::Pending));
        }
    }

    #[test]
    fn test_approval_round_trip_is_allowed() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::AwaitingApproval));
        assert!(RunStatus::AwaitingApproval.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::AwaitingApproval.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_transition_error() {
        let err = RunStatus::Completed.transition(RunStatus::Running).unwrap_err();
        assert_eq!(err.from, RunStatus::Completed);
        assert_eq!(err.to, RunStatus::Running);
        assert_eq!(err.to_string(), "invalid run status transition: completed -> running");
    }
}
