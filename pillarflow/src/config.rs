//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] holds every deployment-level knob. Values missing
//! from a config file fall back to their defaults, and `PILLARFLOW_*`
//! environment variables take precedence over the file.

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RetentionPolicy};
use crate::errors::{ConfigError, PersistenceError};
use crate::observability::LogFormat;
use crate::scheduler::LimiterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "PILLARFLOW_";

fn default_approval_timeout_secs() -> Option<u64> {
    Some(30 * 60)
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Adaptive limiter bounds.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Retention of stored runs.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// How long a checkpoint may wait for a decision. `None` waits forever.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: Option<u64>,

    /// Log line format used by [`init_tracing`](crate::observability::init_tracing).
    #[serde(default)]
    pub log_format: LogFormat,

    /// Directory of the file-backed store. Runs are kept in memory when
    /// unset.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            retention: RetentionPolicy::default(),
            approval_timeout_secs: default_approval_timeout_secs(),
            log_format: LogFormat::default(),
            checkpoint_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the limiter bounds.
    #[must_use]
    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the approval timeout. `None` disables it.
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.approval_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Sets the checkpoint directory.
    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// The approval timeout, if enabled. Zero counts as disabled.
    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Loads a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PILLARFLOW_*` overrides from the process environment.
    pub fn from_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Recognized keys, all prefixed with [`ENV_PREFIX`]: `LIMITER_INITIAL`,
    /// `LIMITER_FLOOR`, `LIMITER_CEILING`, `LIMITER_INCREASE_AFTER`,
    /// `LIMITER_DECREASE_FACTOR`, `RETENTION_HORIZON_SECS`,
    /// `SWEEP_INTERVAL_SECS`, `APPROVAL_TIMEOUT_SECS` (`0` or `none`
    /// disables), `LOG_FORMAT` and `CHECKPOINT_DIR`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("LIMITER_INITIAL") {
            self.limiter.initial = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("LIMITER_FLOOR") {
            self.limiter.floor = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("LIMITER_CEILING") {
            self.limiter.ceiling = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("LIMITER_INCREASE_AFTER") {
            self.limiter.increase_after = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("LIMITER_DECREASE_FACTOR") {
            self.limiter.decrease_factor = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("RETENTION_HORIZON_SECS") {
            self.retention.horizon_secs = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SWEEP_INTERVAL_SECS") {
            self.retention.sweep_interval_secs = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("APPROVAL_TIMEOUT_SECS") {
            self.approval_timeout_secs = if value.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse(&key, &value)?)
            };
        }
        if let Some((key, value)) = get("LOG_FORMAT") {
            self.log_format = value.parse().map_err(|reason| ConfigError::InvalidOverride {
                key,
                value: value.clone(),
                reason,
            })?;
        }
        if let Some((_, value)) = get("CHECKPOINT_DIR") {
            self.checkpoint_dir = (!value.trim().is_empty()).then(|| PathBuf::from(value));
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limiter.validate()?;
        Ok(())
    }

    /// Opens the store this configuration selects.
    pub async fn open_store(&self) -> Result<Arc<dyn CheckpointStore>, PersistenceError> {
        let store: Arc<dyn CheckpointStore> = match &self.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::open(dir).await?),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };
        Ok(store)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(config.retention.horizon(), Duration::from_secs(86_400));
        assert_eq!(config.limiter, LimiterConfig::default());
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.checkpoint_dir.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"limiter": {"ceiling": 16}, "approval_timeout_secs": null, "log_format": "json"}"#,
        )
        .unwrap();

        assert_eq!(config.limiter.ceiling, 16);
        assert_eq!(config.limiter.initial, 4);
        assert_eq!(config.approval_timeout(), None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pillarflow.json");
        std::fs::write(&path, r#"{"retention": {"horizon_secs": 3600}, "checkpoint_dir": "/var/lib/pf"}"#).unwrap();

        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.retention.horizon_secs, 3600);
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/var/lib/pf")));

        assert!(matches!(
            OrchestratorConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            OrchestratorConfig::from_json_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"limiter": {"floor": 9}}"#).unwrap();
        assert!(matches!(
            OrchestratorConfig::from_json_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let config = OrchestratorConfig::default()
            .with_overrides(env(&[
                ("LIMITER_CEILING", "12"),
                ("LIMITER_DECREASE_FACTOR", "0.75"),
                ("APPROVAL_TIMEOUT_SECS", "none"),
                ("LOG_FORMAT", "json"),
                ("CHECKPOINT_DIR", "/tmp/runs"),
                ("SWEEP_INTERVAL_SECS", " 30 "),
            ]))
            .unwrap();

        assert_eq!(config.limiter.ceiling, 12);
        assert!((config.limiter.decrease_factor - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.approval_timeout(), None);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.retention.sweep_interval_secs, 30);
    }

    #[test]
    fn test_bad_override() {
        let err = OrchestratorConfig::default()
            .with_overrides(env(&[("LIMITER_FLOOR", "two")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidOverride { key, value, .. } => {
                assert_eq!(key, "PILLARFLOW_LIMITER_FLOOR");
                assert_eq!(value, "two");
            }
            other => panic!("expected override error, got {other:?}"),
        }

        assert!(matches!(
            OrchestratorConfig::default().with_overrides(env(&[("LIMITER_INITIAL", "20")])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = OrchestratorConfig::default().with_approval_timeout(Some(Duration::ZERO));
        assert_eq!(config.approval_timeout(), None);
    }

    #[tokio::test]
    async fn test_open_store_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::default().with_checkpoint_dir(dir.path().join("runs"));
        let store = config.open_store().await.unwrap();
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(dir.path().join("runs").is_dir());
    }
}
