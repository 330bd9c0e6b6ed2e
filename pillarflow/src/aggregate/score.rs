//! The composite score record.

use crate::core::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much one stage contributed to the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageContribution {
    /// The stage's own score.
    pub score: f64,
    /// The stage's weight after normalization.
    pub weight: f64,
    /// `score * weight`.
    pub contribution: f64,
}

/// Aggregate of a completed run's stage outputs.
///
/// Derived from the run's results and stored only inside that run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    /// The combined score.
    pub gravity_index: f64,
    /// Per-stage breakdown, keyed by stage id.
    pub contributions: BTreeMap<StageId, StageContribution>,
    /// Stage with the largest contribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strongest_stage: Option<StageId>,
    /// Name of the strategy that produced the score.
    pub strategy: String,
}

impl CompositeScore {
    /// Returns the contribution of `stage_id`.
    #[must_use]
    pub fn contribution(&self, stage_id: &str) -> Option<&StageContribution> {
        self.contributions.get(stage_id)
    }
}
