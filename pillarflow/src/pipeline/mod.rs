//! Pipeline definition.
//!
//! This module provides:
//! - The stage operation trait and its input
//! - Stage specifications with retry policies
//! - The registry builder and the validated stage registry
//! - The standard four-pillar gravity pipeline

mod builder;
mod gravity;
mod operation;
mod registry;
mod retry;
mod spec;

pub use builder::RegistryBuilder;
pub use gravity::{gravity_pipeline, PillarOperations, GRAVITY_PIPELINE, PILLAR_TIMEOUT, PILLAR_WEIGHTS};
pub use operation::{FnOperation, StageInput, StageOperation};
pub use registry::StageRegistry;
pub use retry::RetryPolicy;
pub use spec::{validate_stage_id, StageSpec, DEFAULT_STAGE_TIMEOUT, STAGE_ID_MAX_LEN, STAGE_ID_PATTERN};
