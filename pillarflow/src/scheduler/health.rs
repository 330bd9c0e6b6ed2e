//! Point-in-time health of an orchestrator.

use crate::core::StageId;
use crate::resilience::{CircuitRegistry, CircuitState};
use serde::{Deserialize, Serialize};

/// Health of one stage's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitHealth {
    /// The stage guarded by the circuit.
    pub stage_id: StageId,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub consecutive_failures: u32,
}

/// Snapshot returned by [`Orchestrator::health`](super::Orchestrator::health).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Runs currently driven by this process.
    pub active_runs: usize,
    /// Current adaptive concurrency limit.
    pub concurrency_limit: usize,
    /// Stage invocations holding a permit.
    pub permits_in_use: usize,
    /// Every circuit created so far, sorted by stage id.
    pub circuits: Vec<CircuitHealth>,
}

impl HealthReport {
    pub(crate) fn circuits_of(registry: &CircuitRegistry) -> Vec<CircuitHealth> {
        registry
            .snapshot()
            .into_iter()
            .map(|(stage_id, snapshot)| CircuitHealth {
                stage_id,
                state: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
            })
            .collect()
    }

    /// Stages whose circuit is not closed.
    #[must_use]
    pub fn tripped_circuits(&self) -> Vec<&str> {
        self.circuits
            .iter()
            .filter(|c| c.state != CircuitState::Closed)
            .map(|c| c.stage_id.as_str())
            .collect()
    }

    /// True if any circuit is open or probing.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.circuits.iter().any(|c| c.state != CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitPolicy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_report_flags_tripped_circuits() {
        let registry = CircuitRegistry::new();
        let policy = CircuitPolicy::new(1, Duration::from_secs(30));
        registry.breaker("strategy", &policy);
        registry.breaker("creative", &policy).record_failure();

        let report = HealthReport {
            active_runs: 0,
            concurrency_limit: 4,
            permits_in_use: 0,
            circuits: HealthReport::circuits_of(&registry),
        };

        assert_eq!(
            report.circuits.iter().map(|c| c.stage_id.as_str()).collect::<Vec<_>>(),
            vec!["creative", "strategy"]
        );
        assert_eq!(report.tripped_circuits(), vec!["creative"]);
        assert!(report.is_degraded());
    }

    #[test]
    fn test_empty_report_is_healthy() {
        let report = HealthReport {
            active_runs: 0,
            concurrency_limit: 4,
            permits_in_use: 0,
            circuits: Vec::new(),
        };
        assert!(!report.is_degraded());
        assert!(report.tripped_circuits().is_empty());
    }
}
