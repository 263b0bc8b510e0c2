//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::task::RetentionPolicy;

/// Task manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Maximum number of tasks running at once. Zero admits nothing.
    pub max_concurrent: usize,
    /// Maximum number of tasks waiting for a slot. `None` is unbounded.
    pub max_pending: Option<usize>,
    /// Default per-task deadline. `None` disables timeouts.
    pub task_timeout: Option<Duration>,
    /// How long a timed-out worker may take to yield before it is abandoned.
    pub timeout_grace: Duration,
    /// How long shutdown waits for running workers to settle.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_pending: None,
            task_timeout: None,
            timeout_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Process-level configuration for the engine binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub manager: ManagerConfig,
    /// Eviction policy for finished tasks.
    pub retention: RetentionPolicy,
    /// How often the retention sweep runs.
    pub retention_interval: Duration,
    /// libSQL database file. `None` keeps tasks in memory only.
    pub db_path: Option<PathBuf>,
    /// Directory for daily rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            retention: RetentionPolicy {
                max_age: Some(Duration::from_secs(3600)), // 1 hour
                max_terminal: Some(1000),
            },
            retention_interval: Duration::from_secs(60),
            db_path: None,
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `TASK_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Unset or blank keys
    /// keep their defaults; unparsable values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(n) = parse(&get, "TASK_ENGINE_MAX_CONCURRENT")? {
            config.manager.max_concurrent = n;
        }
        config.manager.max_pending = parse(&get, "TASK_ENGINE_MAX_PENDING")?;
        config.manager.task_timeout =
            parse::<u64, _>(&get, "TASK_ENGINE_TASK_TIMEOUT_SECS")?.map(Duration::from_secs);
        if let Some(secs) = parse::<u64, _>(&get, "TASK_ENGINE_TIMEOUT_GRACE_SECS")? {
            config.manager.timeout_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&get, "TASK_ENGINE_RETENTION_SECS")? {
            config.retention.max_age = Some(Duration::from_secs(secs));
        }
        if let Some(max) = parse(&get, "TASK_ENGINE_MAX_RETAINED")? {
            config.retention.max_terminal = Some(max);
        }
        config.db_path = get("TASK_ENGINE_DB_PATH").map(PathBuf::from);
        config.log_dir = get("TASK_ENGINE_LOG_DIR").map(PathBuf::from);

        Ok(config)
    }

    /// Create the log directory, if one is configured.
    pub fn prepare_log_dir(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}
