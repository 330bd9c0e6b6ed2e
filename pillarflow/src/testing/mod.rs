//! Testing utilities for pillarflow pipelines.
//!
//! This module provides:
//! - Scripted stage operations
//! - Fixture registries, a fault-injecting store and an orchestrator harness
//! - Assertions over runs and composite scores

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_attempts, assert_gravity_close, assert_run_status, assert_stage_pending,
    assert_stage_succeeded,
};
pub use fixtures::{
    abcd_registry, abcd_registry_with, fast_retry, pillar_operations, AbcdOperations,
    wait_for_status, FaultyCheckpointStore, TestHarness, ABCD_PIPELINE,
};
pub use mocks::{
    FailingOperation, RecordedInvocation, RecordingOperation, ScriptedOperation, SlowOperation,
    StaticOperation,
};
