//! # Pillarflow
//!
//! Checkpointed, fault-tolerant orchestration of interdependent analysis
//! pillars.
//!
//! A pipeline is a DAG of stages. Each stage wraps an opaque operation
//! (typically a model-inference call) and is executed with:
//!
//! - **Resilience**: per-attempt timeouts, retry with exponential backoff and
//!   jitter, and per-stage circuit breakers
//! - **Durable checkpoints**: every stage result is persisted before the run
//!   moves on, so a crashed run resumes without redoing finished work
//! - **Human checkpoints**: designated stages hold their dependents until an
//!   operator approves or rejects them
//! - **Adaptive concurrency**: an AIMD limiter bounds in-flight invocations
//!   and backs off when upstream services are overloaded
//!
//! Completed runs are combined into a weighted composite, the gravity index.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pillarflow::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = gravity_pipeline(operations)?;
//! let orchestrator = Orchestrator::builder(Arc::new(registry)).build()?;
//!
//! let run_id = orchestrator.start(serde_json::json!({ "brand": "acme" })).await?;
//! // ... once strategy and creative finish, design waits for review
//! orchestrator.approve(run_id, "design", CheckpointDecision::Approved, None).await?;
//!
//! if let RunOutcome::Completed(score) = orchestrator.wait(run_id).await? {
//!     println!("gravity index: {:.3}", score.gravity_index);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod aggregate;
pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod scheduler;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregate::{Aggregator, CombinationStrategy, CompositeScore, WeightedScoreStrategy};
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{
        CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RetentionPolicy,
    };
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        CheckpointDecision, OutputSchema, PipelineRun, RunStatus, RunSummary, StageId, StageOutput,
        StageResult, StageStatus,
    };
    pub use crate::errors::{
        AggregationError, ConfigError, OperationError, OrchestratorError, PersistenceError,
        RunFailure, ValidationError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        gravity_pipeline, FnOperation, PillarOperations, RegistryBuilder, RetryPolicy, StageInput,
        StageOperation, StageRegistry, StageSpec,
    };
    pub use crate::resilience::{CircuitPolicy, CircuitRegistry, CircuitState};
    pub use crate::scheduler::{ApprovalRequest, HealthReport, LimiterConfig, Orchestrator, RunOutcome};
    pub use crate::utils::{RunId, Timestamp};
}
