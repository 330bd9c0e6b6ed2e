//! Event sink system for observability.
//!
//! The orchestrator reports every lifecycle change as a typed
//! [`PipelineEvent`] to the [`EventSink`] it was built with.

mod event;
mod sink;

pub use event::PipelineEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
