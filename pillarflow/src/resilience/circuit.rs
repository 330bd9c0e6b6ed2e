//! Per-stage circuit breakers.
//!
//! Circuit records are keyed by stage id and live for the whole process, so
//! every run of a pipeline shares them. A record has a single writer at a
//! time; readers always see a consistent snapshot.

use crate::core::StageId;
use crate::errors::ValidationError;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker parameters of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitPolicy {
    /// Consecutive failures that open a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown_ms: u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the cool-down as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Validates the policy for the given stage.
    pub fn validate(&self, stage: &str) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::policy(
                stage,
                "circuit",
                "failure_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the cool-down elapses.
    Open,
    /// One probe call is admitted to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change produced by a circuit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    /// Previous state.
    pub from: CircuitState,
    /// New state.
    pub to: CircuitState,
}

/// Returned when a call is refused by an open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time left until a probe will be admitted.
    pub retry_after: Duration,
}

/// Outcome of asking a circuit for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// True if this call is the half-open probe.
    pub probe: bool,
    /// Transition caused by the check (`Open -> HalfOpen`).
    pub transition: Option<CircuitTransition>,
}

/// Consistent view of a circuit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub consecutive_failures: u32,
    /// True while the half-open probe is in flight.
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one stage.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: CircuitPolicy,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed circuit.
    #[must_use]
    pub fn new(policy: CircuitPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Returns a consistent snapshot of the record.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.read();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probe_in_flight: inner.probe_in_flight,
        }
    }

    /// Asks permission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open, or while it is
    /// half-open with its probe already in flight.
    pub fn check(&self) -> Result<Admission, CircuitOpen> {
        self.check_at(Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock.
    pub fn check_at(&self, now: Instant) -> Result<Admission, CircuitOpen> {
        let mut inner = self.inner.write();
        let cooldown = self.policy.cooldown();

        match inner.state {
            CircuitState::Closed => Ok(Admission {
                probe: false,
                transition: None,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(cooldown, |t| now.saturating_duration_since(t));
                if elapsed >= cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(Admission {
                        probe: true,
                        transition: Some(CircuitTransition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    })
                } else {
                    Err(CircuitOpen {
                        retry_after: cooldown.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission {
                        probe: true,
                        transition: None,
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::Closed => None,
            from => {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                Some(CircuitTransition {
                    from,
                    to: CircuitState::Closed,
                })
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        self.record_failure_at(Instant::now())
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock.
    pub fn record_failure_at(&self, now: Instant) -> Option<CircuitTransition> {
        let mut inner = self.inner.write();
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                Some(CircuitTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.policy.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    Some(CircuitTransition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Gives back an admitted probe whose call was abandoned (cancelled)
    /// without an outcome, so the next caller may probe instead.
    pub fn release_probe(&self) {
        self.inner.write().probe_in_flight = false;
    }
}

/// Process-wide circuit records keyed by stage id.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: DashMap<StageId, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker of `stage_id`, creating it from `policy` on first
    /// use. Later policies for the same stage are ignored.
    pub fn breaker(&self, stage_id: &str, policy: &CircuitPolicy) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(stage_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(stage_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(policy.clone())))
                .value(),
        )
    }

    /// Returns the state of `stage_id`, if its circuit exists.
    #[must_use]
    pub fn state(&self, stage_id: &str) -> Option<CircuitState> {
        self.breakers.get(stage_id).map(|b| b.state())
    }

    /// Returns a snapshot of every circuit, sorted by stage id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(StageId, CircuitSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CircuitPolicy {
        CircuitPolicy::new(3, Duration::from_secs(10))
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(policy());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(
            cb.check().unwrap(),
            Admission {
                probe: false,
                transition: None
            }
        );
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();

        assert_eq!(cb.record_failure_at(now), None);
        assert_eq!(cb.record_failure_at(now), None);
        assert_eq!(
            cb.record_failure_at(now),
            Some(CircuitTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );

        let err = cb.check_at(now + Duration::from_secs(4)).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(6));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::new(policy());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.record_success(), None);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }

        let later = now + Duration::from_secs(10);
        let admission = cb.check_at(later).unwrap();
        assert!(admission.probe);
        assert_eq!(
            admission.transition,
            Some(CircuitTransition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen
            })
        );
        assert!(cb.check_at(later).is_err());
        assert!(cb.snapshot().probe_in_flight);
    }

    #[test]
    fn test_probe_success_closes() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }
        cb.check_at(now + Duration::from_secs(11)).unwrap();

        assert_eq!(
            cb.record_success(),
            Some(CircuitTransition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed
            })
        );
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }
        let probe_time = now + Duration::from_secs(10);
        cb.check_at(probe_time).unwrap();

        assert_eq!(
            cb.record_failure_at(probe_time),
            Some(CircuitTransition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Open
            })
        );
        assert!(cb.check_at(probe_time + Duration::from_secs(1)).is_err());
        assert!(cb.check_at(probe_time + Duration::from_secs(10)).unwrap().probe);
    }

    #[test]
    fn test_released_probe_can_be_retaken() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }
        let later = now + Duration::from_secs(10);
        cb.check_at(later).unwrap();
        cb.release_probe();

        let admission = cb.check_at(later).unwrap();
        assert!(admission.probe);
        assert_eq!(admission.transition, None);
    }

    #[test]
    fn test_policy_validation() {
        assert!(CircuitPolicy::default().validate("a").is_ok());
        assert!(CircuitPolicy::new(0, Duration::from_secs(1)).validate("a").is_err());
        assert_eq!(CircuitPolicy::default().cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_registry_shares_records_per_stage() {
        let registry = CircuitRegistry::new();
        let a1 = registry.breaker("strategy", &policy());
        let a2 = registry.breaker("strategy", &CircuitPolicy::default());
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(a2.policy().failure_threshold, 3);

        for _ in 0..3 {
            a1.record_failure();
        }
        assert_eq!(registry.state("strategy"), Some(CircuitState::Open));
        assert_eq!(registry.state("creative"), None);

        registry.breaker("creative", &policy());
        let ids: Vec<_> = registry.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["creative", "strategy"]);
    }
}
