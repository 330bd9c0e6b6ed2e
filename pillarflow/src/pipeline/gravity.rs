//! The standard four-pillar gravity pipeline.
//!
//! ```text
//! strategy ──┐
//!            ├──> design (checkpoint) ──> technology
//! creative ──┘
//! ```

use super::{RegistryBuilder, RetryPolicy, StageOperation, StageRegistry, StageSpec};
use crate::core::OutputSchema;
use crate::errors::ValidationError;
use std::sync::Arc;
use std::time::Duration;

/// Name of the standard pipeline.
pub const GRAVITY_PIPELINE: &str = "gravity";

/// Per-attempt timeout of each pillar, matching the agent timeout.
pub const PILLAR_TIMEOUT: Duration = Duration::from_secs(300);

/// Weight of each pillar in the gravity index.
pub const PILLAR_WEIGHTS: [(&str, f64); 4] = [
    ("strategy", 0.25),
    ("creative", 0.25),
    ("design", 0.25),
    ("technology", 0.25),
];

/// The operations behind the four pillars.
#[derive(Debug, Clone)]
pub struct PillarOperations {
    /// Strategic positioning analysis.
    pub strategy: Arc<dyn StageOperation>,
    /// Creative territory analysis.
    pub creative: Arc<dyn StageOperation>,
    /// Design synthesis, reviewed before technology work starts.
    pub design: Arc<dyn StageOperation>,
    /// Technology and experience planning.
    pub technology: Arc<dyn StageOperation>,
}

/// Builds the standard gravity registry.
///
/// Every pillar uses the model-inference retry policy, a 300 s attempt
/// timeout and a `[0, 1]` score schema. `design` is the checkpoint.
///
/// # Errors
///
/// Never fails for the fixed topology; the `Result` carries the registry
/// validation through.
pub fn gravity_pipeline(ops: PillarOperations) -> Result<StageRegistry, ValidationError> {
    let pillar = |id: &str, op: Arc<dyn StageOperation>| {
        let weight = PILLAR_WEIGHTS
            .iter()
            .find(|(name, _)| *name == id)
            .map_or(0.0, |(_, w)| *w);
        StageSpec::new(id, op)
            .with_timeout(PILLAR_TIMEOUT)
            .with_retry(RetryPolicy::model_inference())
            .with_schema(OutputSchema::unit_score())
            .with_weight(weight)
    };

    RegistryBuilder::new(GRAVITY_PIPELINE)
        .stage(pillar("strategy", ops.strategy))
        .stage(pillar("creative", ops.creative))
        .stage(
            pillar("design", ops.design)
                .with_dependencies(["strategy", "creative"])
                .checkpoint(),
        )
        .stage(pillar("technology", ops.technology).with_dependency("design"))
        .build()
}
