use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for taskherd
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Background task engine configuration
    #[serde(default)]
    pub background: BackgroundTaskConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Background task engine configuration
///
/// Concurrency limits resolve exact key, then provider prefix, then the
/// global default. A configured limit of 0 means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackgroundTaskConfig {
    /// Global default limit per concurrency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_concurrency: Option<usize>,

    /// Limits per provider prefix (text before the first `/`)
    #[serde(default)]
    pub provider_concurrency: HashMap<String, usize>,

    /// Limits per exact concurrency key
    #[serde(default)]
    pub model_concurrency: HashMap<String, usize>,

    /// Cancel a running task after this long without progress
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,

    /// Minimum run time before a task is eligible for the stale check
    #[serde(default = "default_min_runtime_before_stale_ms")]
    pub min_runtime_before_stale_ms: u64,

    /// Idle signals earlier than this after start are deferred
    #[serde(default = "default_min_idle_time_ms")]
    pub min_idle_time_ms: u64,

    /// Prune tasks queued longer than this
    #[serde(default = "default_task_ttl_ms")]
    pub pending_ttl_ms: u64,

    /// Prune tasks running longer than this
    #[serde(default = "default_task_ttl_ms")]
    pub running_ttl_ms: u64,

    /// Keep finished tasks this long after the aggregate notice
    #[serde(default = "default_task_retention_ms")]
    pub task_retention_ms: u64,

    /// Interval of the poll and stale sweeps
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive unchanged polls before stability completion
    #[serde(default = "default_stability_polls")]
    pub stability_polls: u32,

    /// Minimum run time before stability completion
    #[serde(default = "default_min_stability_time_ms")]
    pub min_stability_time_ms: u64,

    /// Upper bound on the context-created hook
    #[serde(default = "default_context_hook_timeout_ms")]
    pub context_hook_timeout_ms: u64,
}

const fn default_stale_timeout_ms() -> u64 {
    180_000
}

const fn default_min_runtime_before_stale_ms() -> u64 {
    30_000
}

const fn default_min_idle_time_ms() -> u64 {
    5_000
}

const fn default_task_ttl_ms() -> u64 {
    30 * 60 * 1000
}

const fn default_task_retention_ms() -> u64 {
    5 * 60 * 1000
}

const fn default_poll_interval_ms() -> u64 {
    3_000
}

const fn default_stability_polls() -> u32 {
    3
}

const fn default_min_stability_time_ms() -> u64 {
    10_000
}

const fn default_context_hook_timeout_ms() -> u64 {
    200
}

impl Default for BackgroundTaskConfig {
    fn default() -> Self {
        Self {
            default_concurrency: None,
            provider_concurrency: HashMap::new(),
            model_concurrency: HashMap::new(),
            stale_timeout_ms: default_stale_timeout_ms(),
            min_runtime_before_stale_ms: default_min_runtime_before_stale_ms(),
            min_idle_time_ms: default_min_idle_time_ms(),
            pending_ttl_ms: default_task_ttl_ms(),
            running_ttl_ms: default_task_ttl_ms(),
            task_retention_ms: default_task_retention_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stability_polls: default_stability_polls(),
            min_stability_time_ms: default_min_stability_time_ms(),
            context_hook_timeout_ms: default_context_hook_timeout_ms(),
        }
    }
}

impl BackgroundTaskConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn min_runtime_before_stale(&self) -> Duration {
        Duration::from_millis(self.min_runtime_before_stale_ms)
    }

    pub fn min_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_idle_time_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    pub fn running_ttl(&self) -> Duration {
        Duration::from_millis(self.running_ttl_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_stability_time(&self) -> Duration {
        Duration::from_millis(self.min_stability_time_ms)
    }

    pub fn context_hook_timeout(&self) -> Duration {
        Duration::from_millis(self.context_hook_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}
