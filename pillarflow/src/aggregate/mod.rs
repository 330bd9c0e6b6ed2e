//! Combination of stage outputs into the composite gravity index.
//!
//! The [`Aggregator`] checks that a run is complete and that each output
//! matches its stage's declared schema, then delegates the arithmetic to a
//! pluggable [`CombinationStrategy`].

mod aggregator;
mod score;
mod strategy;

pub use aggregator::Aggregator;
pub use score::{CompositeScore, StageContribution};
pub use strategy::{CombinationStrategy, ScoredStage, WeightedScoreStrategy};
