//! Core domain model types for pillarflow.
//!
//! This module contains the records the orchestrator reads and persists:
//! - Stage and run status enums with the run lifecycle rules
//! - The tagged stage output and its declared schema
//! - Stage results with their attempt history
//! - The pipeline run record and its summary

mod output;
mod result;
mod run;
mod status;

/// Identifier of a stage within a pipeline.
pub type StageId = String;

pub use output::{OutputSchema, StageOutput};
pub use result::{AttemptRecord, StageResult};
pub use run::{ApprovalRecord, CheckpointDecision, PipelineRun, RunSummary};
pub use status::{RunStatus, StageStatus};
