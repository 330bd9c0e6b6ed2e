//! Combination strategies.

use super::{CompositeScore, StageContribution};
use crate::core::StageId;
use crate::errors::AggregationError;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

/// A stage score ready for combination.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredStage {
    /// The stage.
    pub stage_id: StageId,
    /// Its headline score.
    pub score: f64,
    /// Its declared weight.
    pub weight: f64,
}

/// Rule turning per-stage scores into a composite.
pub trait CombinationStrategy: Send + Sync + Debug {
    /// Strategy name recorded on the composite.
    fn name(&self) -> &str;

    /// Combines `stages`, given in declaration order and never empty.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::InvalidWeights`] when the weights cannot
    /// be used.
    fn combine(&self, stages: &[ScoredStage]) -> Result<CompositeScore, AggregationError>;
}

/// Weight-normalized sum of stage scores.
///
/// Each stage uses its declared weight unless the strategy was given an
/// override for it. Weights are divided by their sum, so only their ratios
/// matter.
#[derive(Debug, Clone, Default)]
pub struct WeightedScoreStrategy {
    overrides: HashMap<StageId, f64>,
}

impl WeightedScoreStrategy {
    /// Creates a strategy using declared weights.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the weight of one stage.
    #[must_use]
    pub fn with_weight(mut self, stage_id: impl Into<StageId>, weight: f64) -> Self {
        self.overrides.insert(stage_id.into(), weight);
        self
    }

    fn weight_of(&self, stage: &ScoredStage) -> f64 {
        self.overrides.get(&stage.stage_id).copied().unwrap_or(stage.weight)
    }
}

impl CombinationStrategy for WeightedScoreStrategy {
    fn name(&self) -> &str {
        "weighted_score"
    }

    fn combine(&self, stages: &[ScoredStage]) -> Result<CompositeScore, AggregationError> {
        let mut total = 0.0;
        for stage in stages {
            let weight = self.weight_of(stage);
            if !weight.is_finite() || weight < 0.0 {
                return Err(AggregationError::InvalidWeights(format!(
                    "stage '{}' has weight {weight}",
                    stage.stage_id
                )));
            }
            total += weight;
        }
        if total <= 0.0 {
            return Err(AggregationError::InvalidWeights(
                "weights of scored stages sum to zero".to_string(),
            ));
        }

        let mut contributions = BTreeMap::new();
        let mut gravity_index = 0.0;
        let mut strongest: Option<(&str, f64)> = None;
        for stage in stages {
            let weight = self.weight_of(stage) / total;
            let contribution = stage.score * weight;
            gravity_index += contribution;
            if strongest.map_or(true, |(_, best)| contribution > best) {
                strongest = Some((&stage.stage_id, contribution));
            }
            contributions.insert(
                stage.stage_id.clone(),
                StageContribution {
                    score: stage.score,
                    weight,
                    contribution,
                },
            );
        }

        Ok(CompositeScore {
            gravity_index,
            contributions,
            strongest_stage: strongest.map(|(id, _)| id.to_string()),
            strategy: self.name().to_string(),
        })
    }
}
