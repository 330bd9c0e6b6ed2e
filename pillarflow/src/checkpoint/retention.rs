//! Retention of stored runs.

use super::CheckpointStore;
use crate::errors::PersistenceError;
use crate::utils::{RunId, Timestamp};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on purges issued to the store at once.
const PURGE_CONCURRENCY: usize = 8;

fn default_horizon_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

/// How long stored runs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Runs untouched for longer than this are purged.
    #[serde(default = "default_horizon_secs")]
    pub horizon_secs: u64,
    /// How often the background sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            horizon_secs: default_horizon_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(horizon: Duration, sweep_interval: Duration) -> Self {
        Self {
            horizon_secs: horizon.as_secs(),
            sweep_interval_secs: sweep_interval.as_secs(),
        }
    }

    /// Retention horizon.
    #[must_use]
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }

    /// Interval between sweeps, never below one second.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// The oldest `updated_at` a run may have at `now` and still be kept.
    #[must_use]
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        i64::try_from(self.horizon_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|horizon| now.checked_sub_signed(horizon))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
    }
}

/// Purges runs older than the policy's horizon.
///
/// Runs for which `is_live` returns true are kept regardless of age.
/// Returns the purged run ids in ascending order.
pub async fn sweep_expired<F>(
    store: &dyn CheckpointStore,
    policy: &RetentionPolicy,
    now: Timestamp,
    is_live: F,
) -> Result<Vec<RunId>, PersistenceError>
where
    F: Fn(RunId) -> bool + Send + Sync,
{
    let cutoff = policy.cutoff(now);
    let candidates: Vec<RunId> = store
        .list_expired(cutoff)
        .await?
        .into_iter()
        .filter(|run_id| {
            let live = is_live(*run_id);
            if live {
                debug!(run_id = %run_id, "Keeping live run past retention horizon");
            }
            !live
        })
        .collect();

    let mut purged: Vec<RunId> = stream::iter(candidates)
        .map(|run_id| async move { store.purge(run_id).await.map(|removed| removed.then_some(run_id)) })
        .buffer_unordered(PURGE_CONCURRENCY)
        .try_filter_map(|purged| async move { Ok(purged) })
        .try_collect()
        .await?;
    purged.sort_unstable();
    if !purged.is_empty() {
        info!(purged = purged.len(), cutoff = %cutoff, "Expired runs purged");
    }
    Ok(purged)
}
