//! Test assertions for runs and stage results.

use crate::aggregate::CompositeScore;
use crate::core::{PipelineRun, RunStatus, StageStatus};

/// Asserts that the run has the given status.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {}, got {} (failure: {:?})",
        run.id, expected, run.status, run.failure
    );
}

/// Asserts that the stage has a succeeded result.
pub fn assert_stage_succeeded(run: &PipelineRun, stage_id: &str) {
    let result = run
        .result_for(stage_id)
        .unwrap_or_else(|| panic!("Stage '{stage_id}' has no result"));
    assert_eq!(
        result.status,
        StageStatus::Succeeded,
        "Expected stage '{stage_id}' to succeed, got error: {:?}",
        result.error
    );
}

/// Asserts that the stage has no recorded result.
pub fn assert_stage_pending(run: &PipelineRun, stage_id: &str) {
    assert!(
        run.result_for(stage_id).is_none(),
        "Expected no result for stage '{stage_id}'"
    );
}

/// Asserts the number of attempts recorded for a stage.
pub fn assert_attempts(run: &PipelineRun, stage_id: &str, expected: usize) {
    let result = run
        .result_for(stage_id)
        .unwrap_or_else(|| panic!("Stage '{stage_id}' has no result"));
    assert_eq!(
        result.attempt_count(),
        expected,
        "Unexpected attempt count for stage '{stage_id}'"
    );
}

/// Asserts the gravity index to within `1e-9`.
pub fn assert_gravity_close(composite: &CompositeScore, expected: f64) {
    assert!(
        (composite.gravity_index - expected).abs() < 1e-9,
        "Expected gravity index {expected}, got {}",
        composite.gravity_index
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageOutput, StageResult};
    use crate::utils::now_utc;
    use serde_json::json;

    fn run_with_a() -> PipelineRun {
        let mut run = PipelineRun::new("abcd", json!({}));
        let now = now_utc();
        run.append_result(StageResult::succeeded("a", StageOutput::score(0.5), Vec::new(), now, now))
            .unwrap();
        run
    }

    #[test]
    fn test_stage_assertions() {
        let run = run_with_a();
        assert_run_status(&run, RunStatus::Pending);
        assert_stage_succeeded(&run, "a");
        assert_stage_pending(&run, "b");
        assert_attempts(&run, "a", 0);
    }

    #[test]
    #[should_panic(expected = "has no result")]
    fn test_missing_stage_panics() {
        assert_stage_succeeded(&run_with_a(), "b");
    }
}
