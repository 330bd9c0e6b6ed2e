//! The checkpoint store trait.

use crate::core::{PipelineRun, StageResult};
use crate::errors::PersistenceError;
use crate::utils::{RunId, Timestamp};
use async_trait::async_trait;
use std::fmt::Debug;

/// Durable storage of [`PipelineRun`] records, keyed by run id.
///
/// Implementations must make writes durable before returning and must
/// serialize concurrent `append_result` calls for the same run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync + Debug {
    /// Writes the whole run record, replacing any previous version.
    async fn save(&self, run: &PipelineRun) -> Result<(), PersistenceError>;

    /// Reads a run record.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] for an unknown run.
    async fn load(&self, run_id: RunId) -> Result<PipelineRun, PersistenceError>;

    /// Appends one stage result to a stored run.
    ///
    /// Re-delivering an identical result is a no-op. A different result for
    /// a stage that already has one is a [`PersistenceError::Conflict`].
    async fn append_result(&self, run_id: RunId, result: &StageResult) -> Result<(), PersistenceError>;

    /// Lists runs last updated before `older_than`.
    async fn list_expired(&self, older_than: Timestamp) -> Result<Vec<RunId>, PersistenceError>;

    /// Deletes a run record. Returns false if there was nothing to delete.
    async fn purge(&self, run_id: RunId) -> Result<bool, PersistenceError>;

    /// Lists every stored run.
    async fn list_runs(&self) -> Result<Vec<RunId>, PersistenceError>;
}
