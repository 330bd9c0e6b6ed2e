//! The per-run driver task.
//!
//! One driver owns one run from start (or resume) to a terminal status. It
//! is the only writer of that run's record: every state change is saved to
//! the checkpoint store before the in-memory copy is replaced and published.

use super::approval::{apply_decision, ApprovalCommand, DecisionEffect};
use super::limiter::{AdaptiveLimiter, LimiterPermit};
use crate::aggregate::Aggregator;
use crate::cancellation::CancellationToken;
use crate::checkpoint::CheckpointStore;
use crate::core::{PipelineRun, RunStatus, StageId, StageResult};
use crate::errors::{InvalidTransition, OrchestratorError, RunFailure, StageErrorDetail, StageErrorKind};
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::{StageInput, StageRegistry};
use crate::resilience::ResilienceWrapper;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Components shared by every run of one orchestrator.
pub(crate) struct RunContext {
    pub(crate) registry: Arc<StageRegistry>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) wrapper: ResilienceWrapper,
    pub(crate) limiter: Arc<AdaptiveLimiter>,
    pub(crate) aggregator: Aggregator,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) approval_timeout: Option<Duration>,
}

pub(crate) struct RunDriver {
    ctx: Arc<RunContext>,
    run: PipelineRun,
    input: Arc<Value>,
    cancel: Arc<CancellationToken>,
    stages_cancel: Arc<CancellationToken>,
    commands: mpsc::Receiver<ApprovalCommand>,
    commands_open: bool,
    state: watch::Sender<Arc<PipelineRun>>,
    in_flight: JoinSet<StageResult>,
    running: HashSet<StageId>,
    pending: VecDeque<StageId>,
    awaiting_since: Option<Instant>,
}

impl RunDriver {
    pub(crate) fn new(
        ctx: Arc<RunContext>,
        run: PipelineRun,
        cancel: Arc<CancellationToken>,
        commands: mpsc::Receiver<ApprovalCommand>,
        state: watch::Sender<Arc<PipelineRun>>,
    ) -> Self {
        let input = Arc::new(run.input.clone());
        let stages_cancel = cancel.child();
        Self {
            ctx,
            run,
            input,
            cancel,
            stages_cancel,
            commands,
            commands_open: true,
            state,
            in_flight: JoinSet::new(),
            running: HashSet::new(),
            pending: VecDeque::new(),
            awaiting_since: None,
        }
    }

    /// Drives the run to a terminal status and returns its final record.
    pub(crate) async fn run(mut self, resumed: bool) -> PipelineRun {
        let span = tracing::info_span!("run", run_id = %self.run.id, pipeline = %self.run.pipeline);
        self.drive(resumed).instrument(span).await;
        self.publish();
        self.run
    }

    async fn drive(&mut self, resumed: bool) {
        if resumed {
            info!(
                status = %self.run.status,
                recorded_stages = self.run.results.len(),
                "Run resumed"
            );
            self.emit(PipelineEvent::RunResumed {
                run_id: self.run.id,
                recorded_stages: self.run.results.len(),
            })
            .await;
        }

        if self.run.status == RunStatus::Pending {
            if !self.commit(|run| run.transition(RunStatus::Running)).await {
                return;
            }
            info!("Run started");
            self.emit(PipelineEvent::RunStarted {
                run_id: self.run.id,
                pipeline: self.run.pipeline.clone(),
            })
            .await;
        }

        loop {
            if self.run.is_terminal() || !self.sync_status().await {
                return;
            }

            self.queue_ready();
            self.dispatch_available();

            if self.in_flight.is_empty()
                && self.pending.is_empty()
                && self.run.status == RunStatus::Running
            {
                self.finish().await;
                return;
            }

            let deadline = self.approval_deadline();
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.cancelled().await;
                    return;
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_joined(joined).await;
                }
                permit = self.ctx.limiter.acquire(), if !self.pending.is_empty() => {
                    if let Some(stage_id) = self.pending.pop_front() {
                        self.spawn_stage(stage_id, permit);
                    }
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.commands_open = false,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.approval_timed_out().await;
                }
            }
        }
    }

    /// Moves between `Running` and `AwaitingApproval` to match the
    /// checkpoints currently waiting. Returns false if the run ended.
    async fn sync_status(&mut self) -> bool {
        let awaiting = self.ctx.registry.awaiting_approval(&self.run);
        if awaiting.is_empty() {
            self.awaiting_since = None;
            if self.run.status == RunStatus::AwaitingApproval {
                if !self.commit(|run| run.transition(RunStatus::Running)).await {
                    return false;
                }
                info!("Checkpoints cleared, run continuing");
            }
            return true;
        }

        self.awaiting_since.get_or_insert_with(Instant::now);
        if self.run.status == RunStatus::Running {
            if !self.commit(|run| run.transition(RunStatus::AwaitingApproval)).await {
                return false;
            }
            info!(stages = ?awaiting, "Run awaiting approval");
            self.emit(PipelineEvent::RunAwaitingApproval {
                run_id: self.run.id,
                stages: awaiting,
            })
            .await;
        }
        true
    }

    fn approval_deadline(&self) -> Option<Instant> {
        let since = self.awaiting_since?;
        since.checked_add(self.ctx.approval_timeout?)
    }

    fn queue_ready(&mut self) {
        let satisfied = self.ctx.registry.satisfied_stages(&self.run);
        for stage_id in self.ctx.registry.ready_stages(&satisfied) {
            if self.run.result_for(&stage_id).is_none()
                && !self.running.contains(&stage_id)
                && !self.pending.contains(&stage_id)
            {
                debug!(stage = %stage_id, "Stage ready");
                self.pending.push_back(stage_id);
            }
        }
    }

    fn dispatch_available(&mut self) {
        while !self.pending.is_empty() {
            let Some(permit) = self.ctx.limiter.try_acquire() else {
                debug!(queued = self.pending.len(), "Concurrency limit reached");
                return;
            };
            if let Some(stage_id) = self.pending.pop_front() {
                self.spawn_stage(stage_id, permit);
            }
        }
    }

    fn spawn_stage(&mut self, stage_id: StageId, permit: LimiterPermit) {
        let Some(spec) = self.ctx.registry.get(&stage_id).cloned() else {
            warn!(stage = %stage_id, "Ready stage missing from registry");
            return;
        };

        let dependencies: BTreeMap<_, _> = spec
            .dependencies
            .iter()
            .filter_map(|dep| {
                self.run
                    .result_for(dep)
                    .and_then(|r| r.output.clone())
                    .map(|output| (dep.clone(), output))
            })
            .collect();
        let input = StageInput::new(self.run.id, stage_id.clone(), Arc::clone(&self.input), dependencies);
        let wrapper = self.ctx.wrapper.clone();
        let cancel = Arc::clone(&self.stages_cancel);

        debug!(stage = %stage_id, "Dispatching stage");
        self.running.insert(stage_id);
        self.in_flight.spawn(async move {
            let result = wrapper.invoke(&spec, &input, &cancel).await;
            permit.finish(&result);
            result
        });
    }

    async fn on_joined(&mut self, joined: Result<StageResult, JoinError>) {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Stage task aborted");
                self.fail(RunFailure::internal(format!("stage task aborted: {e}"))).await;
                return;
            }
        };
        self.running.remove(&result.stage_id);

        let error_kind = result.error.as_ref().map(|e| e.kind);
        if error_kind == Some(StageErrorKind::Cancelled) {
            debug!(stage = %result.stage_id, "Discarding cancelled invocation");
            return;
        }

        let skippable = self
            .ctx
            .registry
            .get(&result.stage_id)
            .is_some_and(|spec| spec.skippable);

        if result.is_success() {
            self.record(result).await;
        } else if skippable {
            let skipped = result.into_skipped();
            warn!(stage = %skipped.stage_id, "Skippable stage failed, continuing without it");
            let event = PipelineEvent::StageSkipped {
                run_id: self.run.id,
                stage_id: skipped.stage_id.clone(),
                error: skipped
                    .error
                    .clone()
                    .unwrap_or_else(|| StageErrorDetail::new(StageErrorKind::Fatal, "stage failed")),
            };
            if self.record(skipped).await {
                self.emit(event).await;
            }
        } else {
            let failure = RunFailure::stage_failed(&result);
            if let Err(e) = self.run.append_result(result) {
                warn!(error = %e, "Failed result not kept on the run");
            }
            self.fail(failure).await;
        }
    }

    /// Appends a result durably, then to the in-memory run.
    async fn record(&mut self, result: StageResult) -> bool {
        if let Err(e) = self.ctx.store.append_result(self.run.id, &result).await {
            error!(stage = %result.stage_id, error = %e, "Persisting stage result failed");
            self.abandon(RunFailure::persistence(&e)).await;
            return false;
        }
        let checkpoint = self
            .ctx
            .registry
            .get(&result.stage_id)
            .is_some_and(|spec| spec.checkpoint && result.is_success());
        let stage_id = result.stage_id.clone();
        match self.run.append_result(result) {
            Ok(_) => {
                debug!(stage = %stage_id, checkpoint, "Stage result recorded");
                self.publish();
                true
            }
            Err(e) => {
                self.abandon(RunFailure::persistence(&e)).await;
                false
            }
        }
    }

    async fn on_command(&mut self, command: ApprovalCommand) {
        let ApprovalCommand { request, reply } = command;
        let mut next = self.run.clone();
        let effect = match apply_decision(&self.ctx.registry, &mut next, &request) {
            Ok(effect) => effect,
            Err(e) => {
                debug!(stage = %request.stage_id, error = %e, "Decision refused");
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(stage = %request.stage_id, decision = %request.decision, "Checkpoint decided");
        self.emit(PipelineEvent::CheckpointDecided {
            run_id: self.run.id,
            stage_id: request.stage_id.clone(),
            decision: request.decision,
        })
        .await;

        let outcome = match effect {
            DecisionEffect::Proceed => {
                if self.persist(next).await {
                    Ok(())
                } else {
                    Err(OrchestratorError::RunFailed {
                        run_id: self.run.id,
                        failure: self
                            .run
                            .failure
                            .clone()
                            .unwrap_or_else(|| RunFailure::internal("decision not persisted")),
                    })
                }
            }
            DecisionEffect::Reject(failure) => {
                self.run = next;
                self.fail(failure).await;
                Ok(())
            }
        };
        let _ = reply.send(outcome);
    }

    async fn approval_timed_out(&mut self) {
        let awaiting = self.ctx.registry.awaiting_approval(&self.run);
        let timeout = self.ctx.approval_timeout.unwrap_or_default();
        warn!(stages = ?awaiting, timeout_secs = timeout.as_secs(), "Approval timed out");
        self.fail(RunFailure::approval_timed_out(&awaiting, timeout)).await;
    }

    async fn finish(&mut self) {
        match self.ctx.aggregator.aggregate(&self.run.results) {
            Ok(composite) => {
                let gravity_index = composite.gravity_index;
                if self.commit(|run| run.complete(composite)).await {
                    info!(gravity_index, "Run completed");
                    self.emit(PipelineEvent::RunCompleted {
                        run_id: self.run.id,
                        gravity_index,
                    })
                    .await;
                }
            }
            Err(e) => {
                error!(error = %e, "Aggregation failed");
                self.fail(RunFailure::aggregation(&e)).await;
            }
        }
    }

    async fn cancelled(&mut self) {
        let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        self.stop_in_flight(&reason).await;
        let recorded = reason.clone();
        if self.commit(|run| run.cancel(recorded)).await {
            info!(reason = %reason, "Run cancelled");
            self.emit(PipelineEvent::RunCancelled {
                run_id: self.run.id,
                reason,
            })
            .await;
        }
    }

    async fn fail(&mut self, failure: RunFailure) {
        self.stop_in_flight("run failed").await;
        error!(kind = %failure.kind, stage = ?failure.stage_id, message = %failure.message, "Run failed");
        let recorded = failure.clone();
        if self.commit(|run| run.fail(recorded)).await {
            self.emit(PipelineEvent::RunFailed {
                run_id: self.run.id,
                failure,
            })
            .await;
        }
    }

    /// Fails the run after the store refused a write. The final state is
    /// saved on a best-effort basis.
    async fn abandon(&mut self, failure: RunFailure) {
        self.stop_in_flight("run failed").await;
        error!(message = %failure.message, "Run halted");
        if let Err(e) = self.run.fail(failure.clone()) {
            warn!(error = %e, "Run already terminal");
            return;
        }
        if let Err(e) = self.ctx.store.save(&self.run).await {
            warn!(error = %e, "Final state not persisted");
        }
        self.publish();
        self.emit(PipelineEvent::RunFailed {
            run_id: self.run.id,
            failure,
        })
        .await;
    }

    /// Cancels every in-flight invocation and waits for them to stop,
    /// discarding their results.
    async fn stop_in_flight(&mut self, reason: &str) {
        self.pending.clear();
        if self.in_flight.is_empty() {
            return;
        }
        debug!(in_flight = self.in_flight.len(), reason, "Stopping in-flight stages");
        self.stages_cancel.cancel(reason);
        while self.in_flight.join_next().await.is_some() {}
        self.running.clear();
    }

    /// Applies `change` to a copy of the run, saves the copy, and adopts it.
    async fn commit<F>(&mut self, change: F) -> bool
    where
        F: FnOnce(&mut PipelineRun) -> Result<(), InvalidTransition>,
    {
        let mut next = self.run.clone();
        if let Err(e) = change(&mut next) {
            error!(error = %e, "Refused run transition");
            self.abandon(RunFailure::internal(e.to_string())).await;
            return false;
        }
        self.persist(next).await
    }

    async fn persist(&mut self, next: PipelineRun) -> bool {
        match self.ctx.store.save(&next).await {
            Ok(()) => {
                self.run = next;
                self.publish();
                true
            }
            Err(e) => {
                error!(error = %e, "Persisting run failed");
                self.abandon(RunFailure::persistence(&e)).await;
                false
            }
        }
    }

    fn publish(&self) {
        self.state.send_replace(Arc::new(self.run.clone()));
    }

    async fn emit(&self, event: PipelineEvent) {
        self.ctx.events.emit(&event).await;
    }
}
