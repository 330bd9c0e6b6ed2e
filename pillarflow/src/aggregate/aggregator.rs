//! The aggregator.

use super::{CombinationStrategy, CompositeScore, ScoredStage, WeightedScoreStrategy};
use crate::core::{StageResult, StageStatus};
use crate::errors::AggregationError;
use crate::pipeline::StageRegistry;
use std::sync::Arc;
use tracing::debug;

/// Validates and combines the results of a completed run.
#[derive(Debug, Clone)]
pub struct Aggregator {
    registry: Arc<StageRegistry>,
    strategy: Arc<dyn CombinationStrategy>,
}

impl Aggregator {
    /// Creates an aggregator using [`WeightedScoreStrategy`].
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self::with_strategy(registry, Arc::new(WeightedScoreStrategy::new()))
    }

    /// Creates an aggregator with a custom strategy.
    #[must_use]
    pub fn with_strategy(
        registry: Arc<StageRegistry>,
        strategy: Arc<dyn CombinationStrategy>,
    ) -> Self {
        Self { registry, strategy }
    }

    /// Returns the strategy name.
    #[must_use]
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Combines `results` into a composite score.
    ///
    /// Skipped stages are left out of the combination. Outputs without a
    /// headline score are validated but contribute nothing.
    ///
    /// # Errors
    ///
    /// - [`AggregationError::IncompleteRun`] listing every non-skippable
    ///   stage without a `Succeeded` result
    /// - [`AggregationError::SchemaViolation`] for the first output that
    ///   does not match its schema
    /// - [`AggregationError::NoScore`] when no output carries a score
    pub fn aggregate(&self, results: &[StageResult]) -> Result<CompositeScore, AggregationError> {
        let succeeded = |id: &str| {
            results
                .iter()
                .find(|r| r.stage_id == id && r.status == StageStatus::Succeeded)
        };

        let missing: Vec<String> = self
            .registry
            .stages()
            .filter(|spec| !spec.skippable && succeeded(&spec.id).is_none())
            .map(|spec| spec.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(AggregationError::IncompleteRun { missing });
        }

        let mut scored = Vec::new();
        for spec in self.registry.stages() {
            let Some(output) = succeeded(&spec.id).and_then(|r| r.output.as_ref()) else {
                continue;
            };
            spec.schema
                .validate(output)
                .map_err(|reason| AggregationError::SchemaViolation {
                    stage: spec.id.clone(),
                    reason,
                })?;
            if let Some(score) = output.score_value() {
                scored.push(ScoredStage {
                    stage_id: spec.id.clone(),
                    score,
                    weight: spec.weight,
                });
            }
        }

        if scored.is_empty() {
            return Err(AggregationError::NoScore);
        }

        let composite = self.strategy.combine(&scored)?;
        debug!(
            gravity_index = composite.gravity_index,
            strategy = %composite.strategy,
            stages = scored.len(),
            "Composite score computed"
        );
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutputSchema, StageOutput};
    use crate::errors::{StageErrorDetail, StageErrorKind};
    use crate::pipeline::{RegistryBuilder, StageOperation, StageSpec};
    use crate::testing::StaticOperation;
    use crate::utils::now_utc;
    use serde_json::json;

    fn spec(id: &str, weight: f64) -> StageSpec {
        let op: Arc<dyn StageOperation> = Arc::new(StaticOperation::score(0.5));
        StageSpec::new(id, op)
            .with_schema(OutputSchema::unit_score())
            .with_weight(weight)
    }

    fn ok(id: &str, output: StageOutput) -> StageResult {
        let now = now_utc();
        StageResult::succeeded(id, output, Vec::new(), now, now)
    }

    fn aggregator(specs: Vec<StageSpec>) -> Aggregator {
        let mut builder = RegistryBuilder::new("agg");
        for s in specs {
            builder.add_stage(s);
        }
        Aggregator::new(Arc::new(builder.build().unwrap()))
    }

    #[test]
    fn test_aggregate_weighted() {
        let agg = aggregator(vec![spec("a", 3.0), spec("b", 1.0)]);
        let composite = agg
            .aggregate(&[ok("a", StageOutput::score(1.0)), ok("b", StageOutput::score(0.0))])
            .unwrap();

        assert!((composite.gravity_index - 0.75).abs() < 1e-9);
        assert_eq!(composite.strongest_stage.as_deref(), Some("a"));
        assert_eq!(agg.strategy_name(), "weighted_score");
    }

    #[test]
    fn test_incomplete_run_lists_every_missing_stage() {
        let agg = aggregator(vec![spec("a", 1.0), spec("b", 1.0), spec("c", 1.0)]);
        let err = agg.aggregate(&[ok("b", StageOutput::score(0.5))]).unwrap_err();
        assert_eq!(
            err,
            AggregationError::IncompleteRun {
                missing: vec!["a".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_skipped_stage_is_left_out() {
        let agg = aggregator(vec![spec("a", 1.0), spec("b", 1.0).skippable()]);
        let now = now_utc();
        let skipped = StageResult::failed(
            "b",
            StageErrorDetail::new(StageErrorKind::Fatal, "no data"),
            Vec::new(),
            now,
            now,
        )
        .into_skipped();

        let composite = agg
            .aggregate(&[ok("a", StageOutput::score(0.6)), skipped])
            .unwrap();
        assert!((composite.gravity_index - 0.6).abs() < 1e-9);
        assert!(composite.contribution("b").is_none());
    }

    #[test]
    fn test_schema_violation() {
        let agg = aggregator(vec![spec("a", 1.0)]);
        let err = agg.aggregate(&[ok("a", StageOutput::score(1.4))]).unwrap_err();
        assert!(matches!(err, AggregationError::SchemaViolation { ref stage, .. } if stage == "a"));

        let err = agg
            .aggregate(&[ok("a", StageOutput::document(json!({})))])
            .unwrap_err();
        assert!(matches!(err, AggregationError::SchemaViolation { .. }));
    }

    #[test]
    fn test_no_score() {
        let op: Arc<dyn StageOperation> = Arc::new(StaticOperation::new(StageOutput::Empty));
        let agg = aggregator(vec![StageSpec::new("a", op)]);
        assert_eq!(
            agg.aggregate(&[ok("a", StageOutput::Empty)]).unwrap_err(),
            AggregationError::NoScore
        );
    }
}
