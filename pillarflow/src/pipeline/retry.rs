//! Retry policy with capped exponential backoff and jitter.

use crate::errors::ValidationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often and how patiently a stage is retried.
///
/// The delay before attempt `n + 1` is
/// `min(base * multiplier^(n - 1), max) + uniform(0, jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Delay cap before jitter, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to every delay.
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::api_call()
    }
}

impl RetryPolicy {
    /// External API calls: 4 attempts, 1 s base, x2, 30 s cap.
    #[must_use]
    pub fn api_call() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: 0,
        }
    }

    /// Model-inference calls: 3 attempts, 2 s base, x2, 60 s cap.
    #[must_use]
    pub fn model_inference() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_ms: 0,
        }
    }

    /// Cheap validation steps: 2 attempts, 500 ms base, 5 s cap.
    #[must_use]
    pub fn validation() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_ms: 0,
        }
    }

    /// Data processing: 3 attempts, 1 s base, x1.5, 15 s cap.
    #[must_use]
    pub fn data_processing() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 15_000,
            jitter_ms: 0,
        }
    }

    /// A single attempt, never retried.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::api_call()
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub fn with_jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = jitter;
        self
    }

    /// Returns true if another attempt may follow attempt `attempt`.
    #[must_use]
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Deterministic part of the delay following failed attempt `attempt`.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay_ms as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = if raw.is_finite() { raw.min(cap) as u64 } else { self.max_delay_ms };
        Duration::from_millis(millis)
    }

    /// Full delay following failed attempt `attempt`, jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay_for(attempt) + Duration::from_millis(jitter)
    }

    /// Validates the policy for the given stage.
    pub fn validate(&self, stage: &str) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::policy(stage, "retry", "max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ValidationError::policy(
                stage,
                "retry",
                format!("multiplier must be finite and >= 1, got {}", self.multiplier),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ValidationError::policy(
                stage,
                "retry",
                "max_delay_ms must not be below base_delay_ms",
            ));
        }
        Ok(())
    }
}
