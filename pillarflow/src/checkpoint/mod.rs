//! Durable storage of pipeline runs.
//!
//! Every state change of a run is written through a [`CheckpointStore`]
//! before the scheduler acts on it, so a run can be resumed from its last
//! recorded state after a crash.

mod file;
mod memory;
mod retention;
mod store;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use retention::{sweep_expired, RetentionPolicy};
pub use store::CheckpointStore;

#[cfg(test)]
pub use store::MockCheckpointStore;
