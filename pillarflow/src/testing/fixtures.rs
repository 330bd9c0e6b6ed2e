//! Ready-made registries, stores and orchestrators for tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::mocks::StaticOperation;
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::core::{PipelineRun, RunStatus, RunSummary, StageId, StageResult};
use crate::errors::{PersistenceError, ValidationError};
use crate::events::CollectingEventSink;
use crate::pipeline::{PillarOperations, RegistryBuilder, RetryPolicy, StageOperation, StageRegistry, StageSpec};
use crate::scheduler::Orchestrator;
use crate::utils::{RunId, Timestamp};

/// Name of the registry built by [`abcd_registry`].
pub const ABCD_PIPELINE: &str = "abcd";

/// A retry policy with millisecond delays: 3 attempts, 1 ms base, 5 ms cap.
#[must_use]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::api_call()
        .with_max_attempts(3)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter_ms(0)
}

/// The operations behind the four stages of [`abcd_registry_with`].
#[derive(Debug, Clone)]
pub struct AbcdOperations {
    /// Root stage `a`.
    pub a: Arc<dyn StageOperation>,
    /// Root stage `b`.
    pub b: Arc<dyn StageOperation>,
    /// Checkpoint `c`, depending on `a` and `b`.
    pub c: Arc<dyn StageOperation>,
    /// Final stage `d`, depending on `c`.
    pub d: Arc<dyn StageOperation>,
}

impl AbcdOperations {
    /// Static score operations for each stage.
    #[must_use]
    pub fn scores(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self {
            a: Arc::new(StaticOperation::score(a)),
            b: Arc::new(StaticOperation::score(b)),
            c: Arc::new(StaticOperation::score(c)),
            d: Arc::new(StaticOperation::score(d)),
        }
    }

    /// Replaces the operation of one stage.
    #[must_use]
    pub fn with(mut self, stage_id: &str, op: Arc<dyn StageOperation>) -> Self {
        match stage_id {
            "a" => self.a = op,
            "b" => self.b = op,
            "c" => self.c = op,
            "d" => self.d = op,
            _ => {}
        }
        self
    }
}

impl Default for AbcdOperations {
    fn default() -> Self {
        Self::scores(0.8, 0.6, 0.7, 0.9)
    }
}

/// The diamond used throughout the tests:
///
/// ```text
/// a ──┐
///     ├──> c (checkpoint) ──> d
/// b ──┘
/// ```
///
/// Scores are 0.8, 0.6, 0.7 and 0.9 with equal weights, giving a gravity
/// index of 0.75.
///
/// # Errors
///
/// Never fails for the fixed topology.
pub fn abcd_registry() -> Result<StageRegistry, ValidationError> {
    abcd_registry_with(AbcdOperations::default())
}

/// Same topology as [`abcd_registry`] with caller-supplied operations.
///
/// # Errors
///
/// Never fails for the fixed topology.
pub fn abcd_registry_with(ops: AbcdOperations) -> Result<StageRegistry, ValidationError> {
    let stage = |id: &str, op: Arc<dyn StageOperation>| StageSpec::new(id, op).with_retry(fast_retry());
    RegistryBuilder::new(ABCD_PIPELINE)
        .stage(stage("a", ops.a))
        .stage(stage("b", ops.b))
        .stage(stage("c", ops.c).with_dependencies(["a", "b"]).checkpoint())
        .stage(stage("d", ops.d).with_dependency("c"))
        .build()
}

/// Static pillar operations with the given strategy, creative, design and
/// technology scores.
#[must_use]
pub fn pillar_operations(scores: [f64; 4]) -> PillarOperations {
    let [strategy, creative, design, technology] = scores;
    PillarOperations {
        strategy: Arc::new(StaticOperation::score(strategy)),
        creative: Arc::new(StaticOperation::score(creative)),
        design: Arc::new(StaticOperation::score(design)),
        technology: Arc::new(StaticOperation::score(technology)),
    }
}

/// An orchestrator wired to an in-memory store and a collecting sink.
#[derive(Debug)]
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// The store behind it.
    pub store: Arc<InMemoryCheckpointStore>,
    /// Every event it emitted.
    pub events: Arc<CollectingEventSink>,
}

impl TestHarness {
    /// Builds a harness around `registry` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the default limiter is rejected.
    pub fn new(registry: StageRegistry) -> Result<Self, ValidationError> {
        let store = Arc::new(InMemoryCheckpointStore::new());
        Self::with_store(registry, store)
    }

    /// Builds a harness sharing an existing store, as a restarted process
    /// would.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the default limiter is rejected.
    pub fn with_store(
        registry: StageRegistry,
        store: Arc<InMemoryCheckpointStore>,
    ) -> Result<Self, ValidationError> {
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = Orchestrator::builder(Arc::new(registry))
            .with_store(store.clone())
            .with_events(events.clone())
            .build()?;
        Ok(Self {
            orchestrator,
            store,
            events,
        })
    }
}

/// Polls `run_id` until it reaches `status`, giving up after five seconds.
///
/// # Panics
///
/// Panics if the run cannot be read or does not reach `status` in time.
pub async fn wait_for_status(orchestrator: &Orchestrator, run_id: RunId, status: RunStatus) -> RunSummary {
    let poll = async {
        loop {
            match orchestrator.status(run_id).await {
                Ok(summary) if summary.status == status => return summary,
                Ok(summary) if summary.status.is_terminal() => {
                    panic!("Run {run_id} ended as {} while waiting for {status}", summary.status)
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => panic!("Reading run {run_id} failed: {e}"),
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), poll).await {
        Ok(summary) => summary,
        Err(_) => panic!("Run {run_id} did not reach {status} in time"),
    }
}

/// A store that fails on demand, backed by an in-memory store.
#[derive(Debug, Default)]
pub struct FaultyCheckpointStore {
    inner: InMemoryCheckpointStore,
    fail_saves: AtomicBool,
    failing_appends: RwLock<HashSet<StageId>>,
    failures: AtomicUsize,
}

impl FaultyCheckpointStore {
    /// Creates a store that does not fail yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `save` fail.
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// Makes appends of `stage_id` fail.
    pub fn fail_appends_for(&self, stage_id: impl Into<StageId>) {
        self.failing_appends.write().insert(stage_id.into());
    }

    /// Number of injected failures so far.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn injected(&self, what: &str) -> PersistenceError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        PersistenceError::Io(std::io::Error::other(format!("injected {what} failure")))
    }
}

#[async_trait]
impl CheckpointStore for FaultyCheckpointStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), PersistenceError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(self.injected("save"));
        }
        self.inner.save(run).await
    }

    async fn load(&self, run_id: RunId) -> Result<PipelineRun, PersistenceError> {
        self.inner.load(run_id).await
    }

    async fn append_result(&self, run_id: RunId, result: &StageResult) -> Result<(), PersistenceError> {
        if self.failing_appends.read().contains(&result.stage_id) {
            return Err(self.injected("append"));
        }
        self.inner.append_result(run_id, result).await
    }

    async fn list_expired(&self, cutoff: Timestamp) -> Result<Vec<RunId>, PersistenceError> {
        self.inner.list_expired(cutoff).await
    }

    async fn purge(&self, run_id: RunId) -> Result<bool, PersistenceError> {
        self.inner.purge(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, PersistenceError> {
        self.inner.list_runs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_abcd_topology() {
        let registry = abcd_registry().unwrap();
        assert_eq!(registry.name(), ABCD_PIPELINE);
        assert_eq!(registry.topological_order(), ["a", "b", "c", "d"]);
        assert_eq!(
            registry.checkpoints().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[tokio::test]
    async fn test_faulty_store_injects_failures() {
        let store = FaultyCheckpointStore::new();
        let run = PipelineRun::new("abcd", json!({}));
        store.save(&run).await.unwrap();

        store.fail_saves();
        assert!(matches!(store.save(&run).await, Err(PersistenceError::Io(_))));
        assert_eq!(store.failures(), 1);
        assert_eq!(store.load(run.id).await.unwrap().id, run.id);
    }
}
