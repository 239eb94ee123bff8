//! Runtime configuration for the coordinator.
//!
//! Loaded with precedence: caller overrides > environment variables
//! (`SHARDLOCK_` prefix) > TOML config file > built-in defaults.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default budget a blocking `lock()` call waits for conflicting leases
/// to be released. Matches the system-wide idle time.
pub const DEFAULT_LOCK_TIMEOUT_MILLIS: u64 = 300_000;

/// Default ceiling on concurrently running batch tasks per supervisor.
pub const DEFAULT_MAX_NUM_BATCH_TASKS: usize = 4;

/// Default number of retries for retryable coordinator operations.
pub const DEFAULT_MAX_RETRY: usize = 3;

/// Default period between task-status polls.
pub const DEFAULT_TASK_STATUS_CHECK_PERIOD_MS: u64 = 1_000;

/// Coordinator knobs. Every field has an explicit default; absent input
/// falls back to it. Snake-case names line up with TOML files and the
/// `SHARDLOCK_` environment variables; the camelCase aliases keep JSON
/// payloads from other implementations readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(alias = "lockTimeoutMillis")]
    pub lock_timeout_millis: u64,
    #[serde(alias = "maxNumBatchTasks")]
    pub max_num_batch_tasks: usize,
    #[serde(alias = "maxRetry")]
    pub max_retry: usize,
    #[serde(alias = "taskStatusCheckPeriodMs")]
    pub task_status_check_period_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_millis: DEFAULT_LOCK_TIMEOUT_MILLIS,
            max_num_batch_tasks: DEFAULT_MAX_NUM_BATCH_TASKS,
            max_retry: DEFAULT_MAX_RETRY,
            task_status_check_period_ms: DEFAULT_TASK_STATUS_CHECK_PERIOD_MS,
        }
    }
}

/// Partial overrides applied on top of every other layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_batch_tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status_check_period_ms: Option<u64>,
}

impl CoordinatorConfig {
    /// Load configuration with precedence: overrides > env > file > defaults.
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CoordinatorConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SHARDLOCK_"));
        figment = figment.merge(Serialized::defaults(overrides));
        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only.
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Configuration loading failure.
#[derive(Debug)]
pub struct ConfigError {
    message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}
