//! The orchestrator control surface.

use super::approval::{apply_decision, ApprovalCommand, ApprovalRequest, DecisionEffect};
use super::driver::{RunContext, RunDriver};
use super::health::HealthReport;
use super::limiter::AdaptiveLimiter;
use crate::aggregate::{Aggregator, CombinationStrategy, CompositeScore};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{sweep_expired, CheckpointStore, InMemoryCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::core::{CheckpointDecision, PipelineRun, RunStatus, RunSummary};
use crate::errors::{OrchestratorError, PersistenceError, RunFailure, ValidationError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::pipeline::StageRegistry;
use crate::resilience::{CircuitRegistry, ResilienceWrapper};
use crate::utils::{now_utc, RunId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 16;

/// Final or current outcome of a run, as returned by
/// [`Orchestrator::result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run completed.
    Completed(CompositeScore),
    /// The run was cancelled.
    Cancelled {
        /// Reason given by the caller.
        reason: String,
    },
    /// The run has not finished.
    InProgress {
        /// Its current status.
        status: RunStatus,
    },
}

impl RunOutcome {
    /// Returns the composite score of a completed run.
    #[must_use]
    pub fn composite(&self) -> Option<&CompositeScore> {
        match self {
            Self::Completed(composite) => Some(composite),
            _ => None,
        }
    }
}

/// Handle to a run driven by this process.
#[derive(Clone)]
struct RunHandle {
    cancel: Arc<CancellationToken>,
    commands: mpsc::Sender<ApprovalCommand>,
    state: watch::Receiver<Arc<PipelineRun>>,
}

impl RunHandle {
    fn snapshot(&self) -> Arc<PipelineRun> {
        Arc::clone(&*self.state.borrow())
    }

    /// True while the driver is alive and the run is not terminal.
    fn is_live(&self) -> bool {
        !self.state.borrow().is_terminal() && !self.commands.is_closed()
    }
}

struct Inner {
    ctx: Arc<RunContext>,
    config: OrchestratorConfig,
    runs: DashMap<RunId, RunHandle>,
}

impl Inner {
    fn handle(&self, run_id: RunId) -> Option<RunHandle> {
        self.runs.get(&run_id).map(|h| h.value().clone())
    }

    fn is_live(&self, run_id: RunId) -> bool {
        self.runs.get(&run_id).is_some_and(|h| h.is_live())
    }
}

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: Arc<StageRegistry>,
    store: Option<Arc<dyn CheckpointStore>>,
    events: Option<Arc<dyn EventSink>>,
    strategy: Option<Arc<dyn CombinationStrategy>>,
    circuits: Option<Arc<CircuitRegistry>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Sets the checkpoint store. Defaults to an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the event sink. Defaults to discarding events.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the combination strategy. Defaults to the weighted score.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn CombinationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Shares circuit records with other orchestrators.
    #[must_use]
    pub fn with_circuits(mut self, circuits: Arc<CircuitRegistry>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the limiter configuration is out of
    /// range.
    pub fn build(self) -> Result<Orchestrator, ValidationError> {
        self.config.limiter.validate()?;

        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let circuits = self.circuits.unwrap_or_default();
        let aggregator = match self.strategy {
            Some(strategy) => Aggregator::with_strategy(Arc::clone(&self.registry), strategy),
            None => Aggregator::new(Arc::clone(&self.registry)),
        };
        let ctx = RunContext {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            wrapper: ResilienceWrapper::new(circuits, Arc::clone(&events)),
            limiter: Arc::new(AdaptiveLimiter::new(self.config.limiter.clone(), Arc::clone(&events))),
            aggregator,
            approval_timeout: self.config.approval_timeout(),
            registry: self.registry,
            events,
        };

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                config: self.config,
                runs: DashMap::new(),
            }),
        })
    }
}

/// Starts, resumes, observes and controls runs of one pipeline.
///
/// Each run is driven by its own task. Runs share the circuit records and
/// the adaptive limiter, nothing else.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.inner.ctx.registry.name())
            .field("runs", &self.inner.runs.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates a builder for `registry`.
    #[must_use]
    pub fn builder(registry: Arc<StageRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            store: None,
            events: None,
            strategy: None,
            circuits: None,
            config: OrchestratorConfig::default(),
        }
    }

    /// Returns the registry runs are executed over.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.inner.ctx.registry
    }

    /// Returns the checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.ctx.store
    }

    /// Returns the shared circuit records.
    #[must_use]
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        self.inner.ctx.wrapper.circuits()
    }

    /// Returns the adaptive limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<AdaptiveLimiter> {
        &self.inner.ctx.limiter
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Reports live runs, limiter occupancy and circuit states.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let limiter = &self.inner.ctx.limiter;
        HealthReport {
            active_runs: self.inner.runs.iter().filter(|h| h.value().is_live()).count(),
            concurrency_limit: limiter.limit(),
            permits_in_use: limiter.in_use(),
            circuits: HealthReport::circuits_of(self.circuits()),
        }
    }

    /// Persists a new run and starts driving it.
    ///
    /// Returns once the `Pending` record is durable; stages run in the
    /// background.
    pub async fn start(&self, input: Value) -> Result<RunId, OrchestratorError> {
        let run = PipelineRun::new(self.inner.ctx.registry.name(), input);
        self.inner.ctx.store.save(&run).await?;
        let run_id = run.id;
        info!(run_id = %run_id, pipeline = %run.pipeline, "Run created");
        self.launch(run, false)?;
        Ok(run_id)
    }

    /// Picks up a stored, unfinished run.
    ///
    /// Recorded stage results are kept; only stages without a result run.
    pub async fn resume(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        if self.inner.is_live(run_id) {
            return Err(OrchestratorError::AlreadyActive(run_id));
        }
        let run = self.load(run_id).await?;
        if run.is_terminal() {
            return Err(OrchestratorError::RunTerminal {
                run_id,
                status: run.status,
            });
        }
        if run.pipeline != self.inner.ctx.registry.name() {
            return Err(OrchestratorError::PipelineMismatch {
                run_id,
                expected: self.inner.ctx.registry.name().to_string(),
                found: run.pipeline,
            });
        }
        self.launch(run, true)
    }

    /// Resumes every stored, unfinished run of this pipeline that is not
    /// already live. Unreadable records are logged and skipped.
    pub async fn resume_incomplete(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let mut resumed = Vec::new();
        for run_id in self.inner.ctx.store.list_runs().await? {
            if self.inner.is_live(run_id) {
                continue;
            }
            let run = match self.inner.ctx.store.load(run_id).await {
                Ok(run) => run,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Skipping unreadable run");
                    continue;
                }
            };
            if run.is_terminal() || run.pipeline != self.inner.ctx.registry.name() {
                continue;
            }
            self.launch(run, true)?;
            resumed.push(run_id);
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), "Resumed incomplete runs");
        }
        Ok(resumed)
    }

    /// Returns a summary of the run.
    pub async fn status(&self, run_id: RunId) -> Result<RunSummary, OrchestratorError> {
        let run = self.current(run_id).await?;
        Ok(run.summary(self.inner.ctx.registry.awaiting_approval(&run)))
    }

    /// Cancels a run and waits until it is recorded as `Cancelled`.
    ///
    /// A run that finishes on its own before noticing the request keeps its
    /// own terminal status.
    pub async fn cancel(&self, run_id: RunId, reason: &str) -> Result<(), OrchestratorError> {
        if let Some(handle) = self.inner.handle(run_id) {
            let snapshot = handle.snapshot();
            if snapshot.is_terminal() {
                return Err(OrchestratorError::RunTerminal {
                    run_id,
                    status: snapshot.status,
                });
            }
            if handle.is_live() {
                info!(run_id = %run_id, reason, "Cancellation requested");
                handle.cancel.cancel(reason);
                let mut state = handle.state;
                state
                    .wait_for(|run| run.is_terminal())
                    .await
                    .map_err(|_| OrchestratorError::DriverStopped(run_id))?;
                return Ok(());
            }
        }

        let mut run = self.load(run_id).await?;
        run.cancel(reason).map_err(|e| OrchestratorError::RunTerminal {
            run_id,
            status: e.from,
        })?;
        self.inner.ctx.store.save(&run).await?;
        info!(run_id = %run_id, reason, "Stored run cancelled");
        self.inner
            .ctx
            .events
            .emit(&PipelineEvent::RunCancelled {
                run_id,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }

    /// Records a decision on a checkpoint stage.
    ///
    /// An approved checkpoint lets its dependents proceed; a rejected one
    /// fails the run. A stored run that is not live is updated in the store
    /// and, when approved, resumed.
    pub async fn approve(
        &self,
        run_id: RunId,
        stage_id: &str,
        decision: CheckpointDecision,
        annotation: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let request = ApprovalRequest {
            stage_id: stage_id.to_string(),
            decision,
            annotation: annotation.map(ToString::to_string),
        };

        if let Some(handle) = self.inner.handle(run_id) {
            let snapshot = handle.snapshot();
            if snapshot.is_terminal() {
                return Err(OrchestratorError::RunTerminal {
                    run_id,
                    status: snapshot.status,
                });
            }
            if handle.is_live() {
                let (reply, verdict) = oneshot::channel();
                handle
                    .commands
                    .send(ApprovalCommand { request, reply })
                    .await
                    .map_err(|_| OrchestratorError::DriverStopped(run_id))?;
                return verdict
                    .await
                    .map_err(|_| OrchestratorError::DriverStopped(run_id))?;
            }
        }

        let mut run = self.load(run_id).await?;
        let effect = apply_decision(&self.inner.ctx.registry, &mut run, &request)?;
        if let DecisionEffect::Reject(failure) = &effect {
            run.fail(failure.clone())
                .map_err(|e| OrchestratorError::RunTerminal {
                    run_id,
                    status: e.from,
                })?;
        }
        self.inner.ctx.store.save(&run).await?;

        let events = &self.inner.ctx.events;
        events
            .emit(&PipelineEvent::CheckpointDecided {
                run_id,
                stage_id: request.stage_id.clone(),
                decision,
            })
            .await;
        match effect {
            DecisionEffect::Proceed => {
                info!(run_id = %run_id, stage = stage_id, "Stored checkpoint approved, resuming");
                self.launch(run, true)
            }
            DecisionEffect::Reject(failure) => {
                info!(run_id = %run_id, stage = stage_id, "Stored checkpoint rejected");
                events.emit(&PipelineEvent::RunFailed { run_id, failure }).await;
                Ok(())
            }
        }
    }

    /// Returns the outcome of a run.
    ///
    /// # Errors
    ///
    /// A failed run yields [`OrchestratorError::RunFailed`] carrying the
    /// failing stage and its attempt history.
    pub async fn result(&self, run_id: RunId) -> Result<RunOutcome, OrchestratorError> {
        let run = self.current(run_id).await?;
        outcome_of(&run)
    }

    /// Waits for a live run to finish and returns its outcome. For a run
    /// not driven by this process this is the same as [`result`](Self::result).
    pub async fn wait(&self, run_id: RunId) -> Result<RunOutcome, OrchestratorError> {
        let Some(handle) = self.inner.handle(run_id) else {
            return self.result(run_id).await;
        };
        let mut state = handle.state;
        let run = state
            .wait_for(|run| run.is_terminal())
            .await
            .map(|run| Arc::clone(&*run))
            .map_err(|_| OrchestratorError::DriverStopped(run_id))?;
        outcome_of(&run)
    }

    /// Purges stored runs past the retention horizon, skipping live runs.
    pub async fn purge_expired(&self) -> Result<Vec<RunId>, PersistenceError> {
        purge_expired(&self.inner).await
    }

    /// Spawns a task that calls [`purge_expired`](Self::purge_expired) at
    /// the configured sweep interval. The task ends once every clone of
    /// this orchestrator is dropped.
    pub fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.retention.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Orchestrator dropped, retention sweeper exiting");
                    return;
                };
                if let Err(e) = purge_expired(&inner).await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        })
    }

    fn launch(&self, run: PipelineRun, resumed: bool) -> Result<(), OrchestratorError> {
        let run_id = run.id;
        let (state_tx, state_rx) = watch::channel(Arc::new(run.clone()));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = Arc::new(CancellationToken::new());

        match self.inner.runs.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_live() {
                    return Err(OrchestratorError::AlreadyActive(run_id));
                }
                entry.insert(RunHandle {
                    cancel: Arc::clone(&cancel),
                    commands: command_tx,
                    state: state_rx,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(RunHandle {
                    cancel: Arc::clone(&cancel),
                    commands: command_tx,
                    state: state_rx,
                });
            }
        }

        let driver = RunDriver::new(Arc::clone(&self.inner.ctx), run, cancel, command_rx, state_tx);
        tokio::spawn(driver.run(resumed));
        Ok(())
    }

    async fn current(&self, run_id: RunId) -> Result<Arc<PipelineRun>, OrchestratorError> {
        match self.inner.handle(run_id) {
            Some(handle) => Ok(handle.snapshot()),
            None => self.load(run_id).await.map(Arc::new),
        }
    }

    async fn load(&self, run_id: RunId) -> Result<PipelineRun, OrchestratorError> {
        match self.inner.ctx.store.load(run_id).await {
            Ok(run) => Ok(run),
            Err(PersistenceError::NotFound(_)) => Err(OrchestratorError::RunNotFound(run_id)),
            Err(e) => Err(e.into()),
        }
    }
}

async fn purge_expired(inner: &Inner) -> Result<Vec<RunId>, PersistenceError> {
    let now = now_utc();
    let policy = inner.config.retention;
    let purged = sweep_expired(inner.ctx.store.as_ref(), &policy, now, |run_id| inner.is_live(run_id)).await?;

    let cutoff = policy.cutoff(now);
    inner.runs.retain(|run_id, handle| {
        if purged.contains(run_id) {
            return false;
        }
        let run = handle.state.borrow();
        !run.is_terminal() || run.updated_at >= cutoff
    });
    Ok(purged)
}

fn outcome_of(run: &PipelineRun) -> Result<RunOutcome, OrchestratorError> {
    match run.status {
        RunStatus::Completed => run
            .composite
            .clone()
            .map(RunOutcome::Completed)
            .ok_or_else(|| OrchestratorError::RunFailed {
                run_id: run.id,
                failure: RunFailure::internal("completed run has no composite score"),
            }),
        RunStatus::Failed => Err(OrchestratorError::RunFailed {
            run_id: run.id,
            failure: run
                .failure
                .clone()
                .unwrap_or_else(|| RunFailure::internal("failure not recorded")),
        }),
        RunStatus::Cancelled => Ok(RunOutcome::Cancelled {
            reason: run.cancel_reason.clone().unwrap_or_default(),
        }),
        status => Ok(RunOutcome::InProgress { status }),
    }
}
