//! File-backed checkpoint store.

use super::CheckpointStore;
use crate::core::{PipelineRun, StageResult};
use crate::errors::PersistenceError;
use crate::utils::{RunId, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RECORD_FORMAT: u32 = 2;
const RECORD_EXTENSION: &str = "json";

/// On-disk record wrapping a run with a checksum of its serialized bytes.
///
/// The run is kept as raw JSON so the bytes verified on load are exactly
/// the bytes hashed on save.
#[derive(Debug, Serialize, Deserialize)]
struct RunRecord {
    format: u32,
    checksum: String,
    run: Box<RawValue>,
}

/// A store keeping one JSON record per run in a directory.
///
/// Records are written to a temporary file, synced, then renamed over the
/// previous version, so a crash leaves either the old or the new record.
/// Each record carries a SHA-256 checksum that is verified on load.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Checkpoint directory ready");
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record path of a run.
    #[must_use]
    pub fn record_path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.{RECORD_EXTENSION}"))
    }

    fn lock_for(&self, run_id: RunId) -> Arc<Mutex<()>> {
        self.locks.entry(run_id).or_default().clone()
    }

    async fn read_record(&self, run_id: RunId) -> Result<PipelineRun, PersistenceError> {
        let bytes = match tokio::fs::read(self.record_path(run_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(PersistenceError::NotFound(run_id)),
            Err(e) => return Err(e.into()),
        };

        let record: RunRecord = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::Corrupted(format!("record for run {run_id} is unreadable: {e}")))?;
        if record.format != RECORD_FORMAT {
            return Err(PersistenceError::Corrupted(format!(
                "record for run {run_id} has unknown format {}",
                record.format
            )));
        }
        let actual = checksum(record.run.get());
        if actual != record.checksum {
            return Err(PersistenceError::Corrupted(format!(
                "checksum mismatch for run {run_id}: stored {}, computed {actual}",
                record.checksum
            )));
        }

        let run: PipelineRun = serde_json::from_str(record.run.get())?;
        if run.id != run_id {
            return Err(PersistenceError::Corrupted(format!(
                "record for run {run_id} holds run {}",
                run.id
            )));
        }
        Ok(run)
    }

    async fn write_record(&self, run: &PipelineRun) -> Result<(), PersistenceError> {
        let body = RawValue::from_string(serde_json::to_string(run)?)?;
        let record = RunRecord {
            format: RECORD_FORMAT,
            checksum: checksum(body.get()),
            run: body,
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let target = self.record_path(run.id);
        let tmp = self.dir.join(format!(".{}.{RECORD_EXTENSION}.tmp", run.id));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;
        sync_dir(&self.dir).await;
        Ok(())
    }
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    match tokio::fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                warn!(dir = %dir.display(), error = %e, "Directory sync failed");
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "Directory open for sync failed"),
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), PersistenceError> {
        let lock = self.lock_for(run.id);
        let _guard = lock.lock().await;
        self.write_record(run).await
    }

    async fn load(&self, run_id: RunId) -> Result<PipelineRun, PersistenceError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        self.read_record(run_id).await
    }

    async fn append_result(&self, run_id: RunId, result: &StageResult) -> Result<(), PersistenceError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let mut run = self.read_record(run_id).await?;
        if run.append_result(result.clone())? {
            self.write_record(&run).await
        } else {
            debug!(run_id = %run_id, stage = %result.stage_id, "Duplicate result ignored");
            Ok(())
        }
    }

    async fn list_expired(&self, older_than: Timestamp) -> Result<Vec<RunId>, PersistenceError> {
        let mut expired = Vec::new();
        for run_id in self.list_runs().await? {
            match self.load(run_id).await {
                Ok(run) if run.updated_at < older_than => expired.push(run_id),
                Ok(_) | Err(PersistenceError::NotFound(_)) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(expired)
    }

    async fn purge(&self, run_id: RunId) -> Result<bool, PersistenceError> {
        let lock = self.lock_for(run_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(self.record_path(run_id)).await {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        self.locks.remove(&run_id);
        Ok(removed)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, PersistenceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(run_id) = stem.parse::<RunId>() {
                runs.push(run_id);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{CompositeScore, StageContribution};
    use crate::core::{RunStatus, StageOutput};
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn result(stage: &str, score: f64) -> StageResult {
        let now = now_utc();
        StageResult::succeeded(stage, StageOutput::score(score), Vec::new(), now, now)
    }

    async fn store() -> (tempfile::TempDir, FileCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("runs")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_round_trip_preserves_the_run() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let mut run = PipelineRun::new("gravity", json!({"brand": "acme", "market": "eu"}));
        run.transition(RunStatus::Running)?;
        run.append_result(result("strategy", 0.731))?;
        run.append_result(result("creative", 0.1 + 0.2))?;
        let mut contributions = BTreeMap::new();
        contributions.insert(
            "strategy".to_string(),
            StageContribution {
                score: 0.731,
                weight: 1.0,
                contribution: 0.731,
            },
        );
        run.complete(CompositeScore {
            gravity_index: 0.731,
            contributions,
            strongest_stage: Some("strategy".into()),
            strategy: "weighted_score".into(),
        })?;

        store.save(&run).await?;
        assert_eq!(store.load(run.id).await?, run);
        assert_eq!(store.list_runs().await?, vec![run.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_result_is_durable() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let run = PipelineRun::new("gravity", json!({}));
        store.save(&run).await?;

        let first = result("strategy", 0.5);
        store.append_result(run.id, &first).await?;
        store.append_result(run.id, &first).await?;
        assert!(matches!(
            store.append_result(run.id, &result("strategy", 0.6)).await,
            Err(PersistenceError::Conflict { .. })
        ));

        let reopened = FileCheckpointStore::open(store.dir()).await?;
        assert_eq!(reopened.load(run.id).await?.results, vec![first]);
        Ok(())
    }

    #[tokio::test]
    async fn test_arbitrary_scores_load_exactly() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let mut scores: Vec<f64> = (0..500).map(|_| rand::random::<f64>()).collect();
        scores.extend([0.418_832_930_329_021_25, 0.1 + 0.2, f64::MIN_POSITIVE, 1.0 - f64::EPSILON]);

        let mut run = PipelineRun::new("gravity", json!({}));
        for (i, score) in scores.iter().enumerate() {
            run.append_result(result(&format!("s{i}"), *score))?;
        }
        store.save(&run).await?;
        let loaded = store.load(run.id).await?;
        assert_eq!(loaded, run);

        for score in scores.iter().take(50) {
            let mut single = PipelineRun::new("gravity", json!({}));
            single.append_result(result("strategy", *score))?;
            store.save(&single).await?;
            let loaded = store.load(single.id).await?;
            let stored = loaded
                .result_for("strategy")
                .and_then(|r| r.output.as_ref())
                .and_then(StageOutput::score_value);
            assert_eq!(stored, Some(*score));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let (_dir, store) = store().await;
        let id = RunId::new();
        assert!(matches!(store.load(id).await, Err(PersistenceError::NotFound(found)) if found == id));
        assert!(matches!(
            store.append_result(id, &result("a", 0.1)).await,
            Err(PersistenceError::NotFound(_))
        ));
        assert!(!store.purge(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_record_is_corrupted() {
        let (_dir, store) = store().await;
        let mut run = PipelineRun::new("gravity", json!({}));
        run.append_result(result("strategy", 0.25)).unwrap();
        store.save(&run).await.unwrap();

        let path = store.record_path(run.id);
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, text.replace("0.25", "0.95")).await.unwrap();

        assert!(matches!(store.load(run.id).await, Err(PersistenceError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_truncated_record_is_corrupted() {
        let (_dir, store) = store().await;
        let run = PipelineRun::new("gravity", json!({}));
        store.save(&run).await.unwrap();

        let path = store.record_path(run.id);
        let bytes = tokio::fs::read(&path).await.unwrap();
        tokio::fs::write(&path, &bytes[..bytes.len() / 2]).await.unwrap();

        assert!(matches!(store.load(run.id).await, Err(PersistenceError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_list_runs_ignores_foreign_files() {
        let (_dir, store) = store().await;
        let run = PipelineRun::new("gravity", json!({}));
        store.save(&run).await.unwrap();
        tokio::fs::write(store.dir().join("notes.txt"), b"hello").await.unwrap();
        tokio::fs::write(store.dir().join("not-a-uuid.json"), b"{}").await.unwrap();

        assert_eq!(store.list_runs().await.unwrap(), vec![run.id]);
    }

    #[tokio::test]
    async fn test_expiry_and_purge() {
        let (_dir, store) = store().await;
        let mut old = PipelineRun::new("gravity", json!({}));
        old.updated_at = now_utc() - chrono::Duration::hours(30);
        let fresh = PipelineRun::new("gravity", json!({}));
        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();

        let cutoff = now_utc() - chrono::Duration::hours(24);
        assert_eq!(store.list_expired(cutoff).await.unwrap(), vec![old.id]);
        assert!(store.purge(old.id).await.unwrap());
        assert!(!store.record_path(old.id).exists());
    }
}
