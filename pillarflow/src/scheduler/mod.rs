//! Run scheduling and the orchestrator control surface.
//!
//! This module provides:
//! - The adaptive limiter bounding concurrent stage invocations
//! - Checkpoint decisions
//! - The per-run driver task
//! - Health reports over circuits and the limiter
//! - The [`Orchestrator`] used to start and control runs

mod approval;
mod driver;
mod health;
mod limiter;
mod orchestrator;

pub use approval::ApprovalRequest;
pub use health::{CircuitHealth, HealthReport};
pub use limiter::{AdaptiveLimiter, Feedback, LimiterConfig, LimiterPermit};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunOutcome};
