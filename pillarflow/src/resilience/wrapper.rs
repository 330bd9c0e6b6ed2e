//! Timeout, retry and circuit breaking around one stage invocation.

use super::{CircuitRegistry, CircuitTransition};
use crate::cancellation::CancellationToken;
use crate::core::{AttemptRecord, StageResult};
use crate::errors::{StageErrorDetail, StageErrorKind};
use crate::events::{EventSink, PipelineEvent};
use crate::observability::SpanTimer;
use crate::pipeline::{StageInput, StageOperation, StageSpec};
use crate::utils::{now_utc, Timestamp};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Wraps stage invocations with the stage's resilience policies.
///
/// The wrapper holds no per-stage state of its own; the only shared state
/// is the circuit registry, which outlives any single run.
#[derive(Clone)]
pub struct ResilienceWrapper {
    circuits: Arc<CircuitRegistry>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ResilienceWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceWrapper")
            .field("circuits", &self.circuits)
            .finish_non_exhaustive()
    }
}

impl ResilienceWrapper {
    /// Creates a wrapper over shared circuit records.
    #[must_use]
    pub fn new(circuits: Arc<CircuitRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { circuits, events }
    }

    /// Returns the shared circuit records.
    #[must_use]
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Runs `spec`'s operation until it succeeds, fails for good, or
    /// `cancel` fires. A stage that fails for good and declares a fallback
    /// gets one fallback invocation; if that succeeds the result is marked
    /// as a fallback success.
    ///
    /// Never returns an error: every outcome, including cancellation, is a
    /// [`StageResult`] carrying the full attempt history.
    pub async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> StageResult {
        let span = tracing::info_span!("stage", run_id = %input.run_id, stage = %spec.id);
        async {
            let result = self.invoke_primary(spec, input, cancel).await;
            match &spec.fallback {
                Some(fallback) if !result.is_success() => {
                    self.fall_back(spec, &**fallback, input, cancel, result).await
                }
                _ => result,
            }
        }
        .instrument(span)
        .await
    }

    async fn invoke_primary(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> StageResult {
        let breaker = self.circuits.breaker(&spec.id, &spec.circuit);
        let started_at = now_utc();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 1;

        loop {
            let attempt_started = now_utc();

            if cancel.is_cancelled() {
                return cancelled(spec, attempts, started_at);
            }

            let admission = match breaker.check() {
                Ok(admission) => admission,
                Err(open) => {
                    warn!(
                        attempt,
                        retry_after_ms = u64::try_from(open.retry_after.as_millis()).unwrap_or(u64::MAX),
                        "Circuit open, failing fast"
                    );
                    let error = StageErrorDetail::circuit_open(&spec.id);
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at: attempt_started,
                        finished_at: now_utc(),
                        error: Some(error.clone()),
                    });
                    return self.failed(spec, input, error, attempts, started_at).await;
                }
            };
            if let Some(transition) = admission.transition {
                self.circuit_moved(&spec.id, transition).await;
            }

            self.events
                .emit(&PipelineEvent::StageStarted {
                    run_id: input.run_id,
                    stage_id: spec.id.clone(),
                    attempt,
                })
                .await;
            debug!(attempt, probe = admission.probe, "Attempt started");

            let timer = SpanTimer::start(format!("{}#{attempt}", spec.id));
            let attempt_input = input.for_attempt(attempt);
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                res = tokio::time::timeout(spec.timeout, spec.operation.execute(&attempt_input)) => Some(res),
            };

            let Some(outcome) = outcome else {
                if admission.probe {
                    breaker.release_probe();
                }
                attempts.push(AttemptRecord {
                    attempt,
                    started_at: attempt_started,
                    finished_at: now_utc(),
                    error: Some(StageErrorDetail::new(StageErrorKind::Cancelled, "invocation cancelled")),
                });
                return cancelled(spec, attempts, started_at);
            };

            let error = match outcome {
                Ok(Ok(output)) => {
                    if let Some(transition) = breaker.record_success() {
                        self.circuit_moved(&spec.id, transition).await;
                    }
                    let finished_at = now_utc();
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at: attempt_started,
                        finished_at,
                        error: None,
                    });
                    info!(attempt, duration_ms = timer.finish(), "Stage succeeded");
                    self.events
                        .emit(&PipelineEvent::StageSucceeded {
                            run_id: input.run_id,
                            stage_id: spec.id.clone(),
                            attempts: attempts.len(),
                        })
                        .await;
                    return StageResult::succeeded(spec.id.clone(), output, attempts, started_at, finished_at);
                }
                Ok(Err(op_error)) => StageErrorDetail::from(&op_error),
                Err(_elapsed) => StageErrorDetail::timeout(spec.timeout),
            };

            if let Some(transition) = breaker.record_failure() {
                self.circuit_moved(&spec.id, transition).await;
            }
            attempts.push(AttemptRecord {
                attempt,
                started_at: attempt_started,
                finished_at: now_utc(),
                error: Some(error.clone()),
            });

            if !error.kind.is_retryable() || !spec.retry.allows_retry_after(attempt) {
                return self.failed(spec, input, error, attempts, started_at).await;
            }

            let delay = spec.retry.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(attempt, delay_ms, error = %error, "Attempt failed, retrying");
            self.events
                .emit(&PipelineEvent::StageRetrying {
                    run_id: input.run_id,
                    stage_id: spec.id.clone(),
                    attempt,
                    delay_ms,
                    error,
                })
                .await;

            tokio::select! {
                biased;
                () = cancel.cancelled() => return cancelled(spec, attempts, started_at),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Invokes the fallback once, under the stage timeout. The primary
    /// failure stands if the fallback fails too.
    async fn fall_back(
        &self,
        spec: &StageSpec,
        fallback: &dyn StageOperation,
        input: &StageInput,
        cancel: &CancellationToken,
        failed: StageResult,
    ) -> StageResult {
        let Some(primary) = failed.error.clone() else {
            return failed;
        };
        if primary.kind == StageErrorKind::Cancelled {
            return failed;
        }

        info!(error = %primary, "Invoking fallback");
        let attempt = u32::try_from(failed.attempt_count()).unwrap_or(u32::MAX).saturating_add(1);
        let fallback_input = input.for_attempt(attempt);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = tokio::time::timeout(spec.timeout, fallback.execute(&fallback_input)) => Some(res),
        };

        match outcome {
            None => cancelled(spec, failed.attempts, failed.started_at),
            Some(Ok(Ok(output))) => {
                warn!(error = %primary, "Stage degraded to its fallback output");
                self.events
                    .emit(&PipelineEvent::StageFallback {
                        run_id: input.run_id,
                        stage_id: spec.id.clone(),
                        error: primary,
                    })
                    .await;
                failed.into_fallback(output, now_utc())
            }
            Some(Ok(Err(e))) => {
                error!(error = %e, "Fallback failed, keeping the primary failure");
                failed
            }
            Some(Err(_elapsed)) => {
                error!(
                    timeout_ms = u64::try_from(spec.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Fallback timed out, keeping the primary failure"
                );
                failed
            }
        }
    }

    async fn failed(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        error: StageErrorDetail,
        attempts: Vec<AttemptRecord>,
        started_at: Timestamp,
    ) -> StageResult {
        warn!(attempts = attempts.len(), error = %error, "Stage failed");
        self.events
            .emit(&PipelineEvent::StageFailed {
                run_id: input.run_id,
                stage_id: spec.id.clone(),
                attempts: attempts.len(),
                error: error.clone(),
            })
            .await;
        StageResult::failed(spec.id.clone(), error, attempts, started_at, now_utc())
    }

    async fn circuit_moved(&self, stage_id: &str, transition: CircuitTransition) {
        warn!(from = %transition.from, to = %transition.to, "Circuit transition");
        self.events
            .emit(&PipelineEvent::CircuitTransition {
                stage_id: stage_id.to_string(),
                from: transition.from,
                to: transition.to,
            })
            .await;
    }
}

fn cancelled(spec: &StageSpec, attempts: Vec<AttemptRecord>, started_at: Timestamp) -> StageResult {
    debug!("Invocation cancelled");
    StageResult::failed(
        spec.id.clone(),
        StageErrorDetail::new(StageErrorKind::Cancelled, "invocation cancelled"),
        attempts,
        started_at,
        now_utc(),
    )
}
