//! Resilience layer wrapped around every stage invocation.
//!
//! This module provides:
//! - Per-stage circuit breakers shared process-wide
//! - The [`ResilienceWrapper`] applying timeout, retry with backoff and
//!   circuit breaking to one invocation

mod circuit;
mod wrapper;

pub use circuit::{
    Admission, CircuitBreaker, CircuitOpen, CircuitPolicy, CircuitRegistry, CircuitSnapshot,
    CircuitState, CircuitTransition,
};
pub use wrapper::ResilienceWrapper;
