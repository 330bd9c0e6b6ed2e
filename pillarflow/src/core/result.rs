//! Stage results and attempt history.

use super::{StageId, StageOutput, StageStatus};
use crate::errors::StageErrorDetail;
use crate::utils::{millis_between, Timestamp};
use serde::{Deserialize, Serialize};

/// One invocation of a stage operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: Timestamp,
    /// When the attempt finished.
    pub finished_at: Timestamp,
    /// Why the attempt failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageErrorDetail>,
}

impl AttemptRecord {
    /// Returns the attempt duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        millis_between(&self.started_at, &self.finished_at)
    }

    /// Returns true if the attempt produced an output.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The outcome of one stage within one run.
///
/// Results are immutable once created and appended to the run's log at most
/// once per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage this result belongs to.
    pub stage_id: StageId,
    /// Final stage status.
    pub status: StageStatus,
    /// Output of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageErrorDetail>,
    /// Every attempt in order.
    pub attempts: Vec<AttemptRecord>,
    /// When the first attempt started.
    pub started_at: Timestamp,
    /// When the last attempt finished.
    pub finished_at: Timestamp,
    /// Whether the output came from the stage's fallback after the primary
    /// operation failed. `error` then holds the primary failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl StageResult {
    /// Creates a succeeded result.
    #[must_use]
    pub fn succeeded(
        stage_id: impl Into<StageId>,
        output: StageOutput,
        attempts: Vec<AttemptRecord>,
        started_at: Timestamp,
        finished_at: Timestamp,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Succeeded,
            output: Some(output),
            error: None,
            attempts,
            started_at,
            finished_at,
            fallback: false,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(
        stage_id: impl Into<StageId>,
        error: StageErrorDetail,
        attempts: Vec<AttemptRecord>,
        started_at: Timestamp,
        finished_at: Timestamp,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            started_at,
            finished_at,
            fallback: false,
        }
    }

    /// Degrades a failed result to `Skipped`, keeping its error and history.
    #[must_use]
    pub fn into_skipped(self) -> Self {
        Self {
            status: StageStatus::Skipped,
            ..self
        }
    }

    /// Replaces a failed result with a fallback output. The primary error
    /// and attempt history are kept.
    #[must_use]
    pub fn into_fallback(self, output: StageOutput, finished_at: Timestamp) -> Self {
        Self {
            status: StageStatus::Succeeded,
            output: Some(output),
            finished_at,
            fallback: true,
            ..self
        }
    }

    /// Number of attempts made.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    /// Total wall-clock duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        millis_between(&self.started_at, &self.finished_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageErrorKind;
    use crate::utils::now_utc;
    use chrono::Duration;

    fn attempt(n: u32, error: Option<StageErrorDetail>) -> AttemptRecord {
        let now = now_utc();
        AttemptRecord {
            attempt: n,
            started_at: now,
            finished_at: now + Duration::milliseconds(10),
            error,
        }
    }

    #[test]
    fn test_succeeded_result() {
        let now = now_utc();
        let result = StageResult::succeeded(
            "strategy",
            StageOutput::score(0.7),
            vec![
                attempt(1, Some(StageErrorDetail::new(StageErrorKind::Transient, "503"))),
                attempt(2, None),
            ],
            now,
            now + Duration::milliseconds(40),
        );

        assert!(result.is_success());
        assert_eq!(result.attempt_count(), 2);
        assert_eq!(result.duration_ms(), 40);
        assert!(!result.attempts[0].succeeded());
        assert!(result.attempts[1].succeeded());
        assert_eq!(result.attempts[1].duration_ms(), 10);
    }

    #[test]
    fn test_into_skipped_keeps_history() {
        let now = now_utc();
        let error = StageErrorDetail::new(StageErrorKind::Fatal, "bad");
        let result = StageResult::failed("creative", error.clone(), vec![attempt(1, Some(error.clone()))], now, now)
            .into_skipped();

        assert_eq!(result.status, StageStatus::Skipped);
        assert_eq!(result.error, Some(error));
        assert_eq!(result.attempt_count(), 1);
    }

    #[test]
    fn test_into_fallback_keeps_primary_error() {
        let now = now_utc();
        let error = StageErrorDetail::new(StageErrorKind::Transient, "quota");
        let result = StageResult::failed("technology", error.clone(), vec![attempt(1, Some(error.clone()))], now, now)
            .into_fallback(StageOutput::score(0.4), now + Duration::milliseconds(5));

        assert!(result.is_success());
        assert!(result.fallback);
        assert_eq!(result.output, Some(StageOutput::score(0.4)));
        assert_eq!(result.error, Some(error));
        assert_eq!(result.duration_ms(), 5);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["fallback"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_primary_result_omits_fallback_flag() {
        let now = now_utc();
        let result = StageResult::succeeded("design", StageOutput::score(0.9), Vec::new(), now, now);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("fallback").is_none());
    }

    #[test]
    fn test_result_round_trips_through_json() {
        let now = now_utc();
        let result = StageResult::succeeded("design", StageOutput::score(0.9), vec![attempt(1, None)], now, now);
        let json = serde_json::to_string(&result).unwrap();
        let back: StageResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
