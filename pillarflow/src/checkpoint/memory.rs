//! In-memory checkpoint store.

use super::CheckpointStore;
use crate::core::{PipelineRun, StageResult};
use crate::errors::PersistenceError;
use crate::utils::{RunId, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// A process-local store backed by a sharded concurrent map.
///
/// Records do not survive a restart. Appends for one run are serialized by
/// the map's shard lock.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<RunId, PipelineRun>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), PersistenceError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<PipelineRun, PersistenceError> {
        self.runs
            .get(&run_id)
            .map(|r| r.value().clone())
            .ok_or(PersistenceError::NotFound(run_id))
    }

    async fn append_result(&self, run_id: RunId, result: &StageResult) -> Result<(), PersistenceError> {
        let mut run = self.runs.get_mut(&run_id).ok_or(PersistenceError::NotFound(run_id))?;
        if !run.append_result(result.clone())? {
            debug!(run_id = %run_id, stage = %result.stage_id, "Duplicate result ignored");
        }
        Ok(())
    }

    async fn list_expired(&self, older_than: Timestamp) -> Result<Vec<RunId>, PersistenceError> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.updated_at < older_than)
            .map(|r| *r.key())
            .collect())
    }

    async fn purge(&self, run_id: RunId) -> Result<bool, PersistenceError> {
        Ok(self.runs.remove(&run_id).is_some())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, PersistenceError> {
        Ok(self.runs.iter().map(|r| *r.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutput;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn result(stage: &str, score: f64) -> StageResult {
        let now = now_utc();
        StageResult::succeeded(stage, StageOutput::score(score), Vec::new(), now, now)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryCheckpointStore::new();
        let run = PipelineRun::new("gravity", json!({"brand": "acme"}));
        store.save(&run).await.unwrap();

        assert_eq!(store.load(run.id).await.unwrap(), run);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_load_unknown_run() {
        let store = InMemoryCheckpointStore::new();
        let id = RunId::new();
        assert!(matches!(store.load(id).await, Err(PersistenceError::NotFound(found)) if found == id));
    }

    #[tokio::test]
    async fn test_append_is_idempotent_and_detects_conflicts() {
        let store = InMemoryCheckpointStore::new();
        let run = PipelineRun::new("gravity", json!({}));
        store.save(&run).await.unwrap();

        let first = result("strategy", 0.4);
        store.append_result(run.id, &first).await.unwrap();
        store.append_result(run.id, &first).await.unwrap();
        let err = store
            .append_result(run.id, &result("strategy", 0.9))
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Conflict { .. }));
        assert_eq!(store.load(run.id).await.unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_one_run() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let run = PipelineRun::new("gravity", json!({}));
        store.save(&run).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_result(run.id, &result(&format!("stage-{i}"), 0.5))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load(run.id).await.unwrap().results.len(), 16);
    }

    #[tokio::test]
    async fn test_list_expired_and_purge() {
        let store = InMemoryCheckpointStore::new();
        let mut old = PipelineRun::new("gravity", json!({}));
        old.updated_at = now_utc() - chrono::Duration::hours(48);
        let fresh = PipelineRun::new("gravity", json!({}));
        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();

        let cutoff = now_utc() - chrono::Duration::hours(24);
        assert_eq!(store.list_expired(cutoff).await.unwrap(), vec![old.id]);

        assert!(store.purge(old.id).await.unwrap());
        assert!(!store.purge(old.id).await.unwrap());
        assert_eq!(store.list_runs().await.unwrap(), vec![fresh.id]);
    }
}
