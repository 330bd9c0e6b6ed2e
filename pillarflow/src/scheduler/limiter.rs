//! Adaptive concurrency limiter shared by every run.
//!
//! The limit follows an additive-increase / multiplicative-decrease rule:
//! it grows by one after a streak of healthy invocations and shrinks by a
//! factor when an invocation shows overload (an attempt timed out or was
//! refused by an open circuit).

use crate::core::StageResult;
use crate::errors::{StageErrorKind, ValidationError};
use crate::events::{EventSink, PipelineEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

fn default_initial() -> usize {
    4
}

fn default_floor() -> usize {
    2
}

fn default_ceiling() -> usize {
    8
}

fn default_increase_after() -> u32 {
    5
}

fn default_decrease_factor() -> f64 {
    0.5
}

/// Bounds and step sizes of the adaptive limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Limit at startup.
    #[serde(default = "default_initial")]
    pub initial: usize,
    /// The limit never drops below this.
    #[serde(default = "default_floor")]
    pub floor: usize,
    /// The limit never grows above this.
    #[serde(default = "default_ceiling")]
    pub ceiling: usize,
    /// Consecutive healthy invocations before the limit grows by one.
    #[serde(default = "default_increase_after")]
    pub increase_after: u32,
    /// Factor applied to the limit on overload.
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            floor: default_floor(),
            ceiling: default_ceiling(),
            increase_after: default_increase_after(),
            decrease_factor: default_decrease_factor(),
        }
    }
}

impl LimiterConfig {
    /// A limiter pinned at `limit`.
    #[must_use]
    pub fn fixed(limit: usize) -> Self {
        Self {
            initial: limit,
            floor: limit,
            ceiling: limit,
            ..Self::default()
        }
    }

    /// Sets the bounds.
    #[must_use]
    pub fn with_bounds(mut self, floor: usize, initial: usize, ceiling: usize) -> Self {
        self.floor = floor;
        self.initial = initial;
        self.ceiling = ceiling;
        self
    }

    /// Sets the healthy streak length.
    #[must_use]
    pub fn with_increase_after(mut self, n: u32) -> Self {
        self.increase_after = n;
        self
    }

    /// Sets the decrease factor.
    #[must_use]
    pub fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }

    /// Checks `1 <= floor <= initial <= ceiling`, a positive streak length
    /// and a decrease factor in `(0, 1)`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |reason: String| Err(ValidationError::policy("limiter", "limiter", reason));
        if self.floor == 0 {
            return fail("floor must be at least 1".to_string());
        }
        if !(self.floor <= self.initial && self.initial <= self.ceiling) {
            return fail(format!(
                "expected floor <= initial <= ceiling, got {} / {} / {}",
                self.floor, self.initial, self.ceiling
            ));
        }
        if self.increase_after == 0 {
            return fail("increase_after must be at least 1".to_string());
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return fail(format!(
                "decrease_factor must be in (0, 1), got {}",
                self.decrease_factor
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    in_use: usize,
    healthy_streak: u32,
}

/// How a finished invocation bears on the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Succeeded on the primary operation without any overloaded attempt.
    Healthy,
    /// At least one attempt timed out or hit an open circuit.
    Overloaded,
    /// Failed for other reasons, or was rescued by a fallback; resets the
    /// healthy streak.
    Neutral,
}

impl Feedback {
    /// Classifies a stage result.
    #[must_use]
    pub fn from_result(result: &StageResult) -> Self {
        let overloaded = result
            .attempts
            .iter()
            .filter_map(|a| a.error.as_ref())
            .any(|e| e.kind.is_overload());
        if overloaded {
            Self::Overloaded
        } else if result.is_success() && !result.fallback {
            Self::Healthy
        } else {
            Self::Neutral
        }
    }
}

/// AIMD concurrency limiter.
pub struct AdaptiveLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    released: Notify,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl AdaptiveLimiter {
    /// Creates a limiter starting at `config.initial`.
    #[must_use]
    pub fn new(config: LimiterConfig, events: Arc<dyn EventSink>) -> Self {
        let limit = config.initial;
        Self {
            config,
            state: Mutex::new(LimiterState {
                limit,
                in_use: 0,
                healthy_streak: 0,
            }),
            released: Notify::new(),
            events,
        }
    }

    /// Current limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Takes a permit if one is free.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<LimiterPermit> {
        let mut state = self.state.lock();
        if state.in_use < state.limit {
            state.in_use += 1;
            Some(LimiterPermit {
                limiter: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Waits for a permit. Cancel safe.
    pub async fn acquire(self: &Arc<Self>) -> LimiterPermit {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            released.await;
        }
    }

    /// Adjusts the limit from one invocation's outcome.
    pub fn record(&self, feedback: Feedback) {
        let adjusted = {
            let mut state = self.state.lock();
            let before = state.limit;
            match feedback {
                Feedback::Healthy => {
                    state.healthy_streak += 1;
                    if state.healthy_streak >= self.config.increase_after {
                        state.healthy_streak = 0;
                        state.limit = (state.limit + 1).min(self.config.ceiling);
                    }
                }
                Feedback::Overloaded => {
                    state.healthy_streak = 0;
                    #[allow(
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss,
                        clippy::cast_precision_loss
                    )]
                    let shrunk = (state.limit as f64 * self.config.decrease_factor).floor() as usize;
                    state.limit = shrunk.max(self.config.floor);
                }
                Feedback::Neutral => state.healthy_streak = 0,
            }
            (before != state.limit).then_some((before, state.limit))
        };

        if let Some((from, to)) = adjusted {
            info!(from, to, ?feedback, "Concurrency limit adjusted");
            self.events.try_emit(&PipelineEvent::LimiterAdjusted { from, to });
            if to > from {
                self.released.notify_waiters();
            }
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// A held slot of the limiter, released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<AdaptiveLimiter>,
}

impl LimiterPermit {
    /// Reports the outcome of the invocation this permit covered, then
    /// releases it.
    pub fn finish(self, result: &StageResult) {
        self.limiter.record(Feedback::from_result(result));
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
