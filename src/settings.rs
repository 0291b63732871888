use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Optional slatedb flush interval; tests use a small value to keep writes fast.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
            flush_interval_ms: None,
        }
    }
}

fn default_backend() -> Backend {
    Backend::Fs
}

fn default_db_path() -> String {
    "/tmp/depot".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    Memory,
    Url,
}

/// Timeouts and retention for the job scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// How long an assigned job may sit in WAITING before it is nacked back to QUEUED.
    #[serde(default = "default_waiting_timeout_ms")]
    pub waiting_timeout_ms: u64,
    /// How long a RUNNING job may go without a heartbeat before it is force-cancelled.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Maximum number of jobs kept in the memory index; only terminal jobs are pruned.
    #[serde(default = "default_index_max")]
    pub job_index_max: usize,
    /// Maximum number of operation records kept per memory index.
    #[serde(default = "default_index_max")]
    pub operation_index_max: usize,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            waiting_timeout_ms: default_waiting_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            job_index_max: default_index_max(),
            operation_index_max: default_index_max(),
            prune_interval_ms: default_prune_interval_ms(),
            output_buffer_lines: default_output_buffer_lines(),
        }
    }
}

impl SchedulerConfig {
    pub fn waiting_timeout(&self) -> Duration {
        Duration::from_millis(self.waiting_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms.max(1))
    }
}

fn default_waiting_timeout_ms() -> u64 {
    120_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    120_000
}

fn default_index_max() -> usize {
    10_000
}

fn default_prune_interval_ms() -> u64 {
    600_000
}

fn default_output_buffer_lines() -> usize {
    1_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the prometheus `/metrics` endpoint, e.g. 127.0.0.1:9090
    #[serde(default)]
    pub addr: Option<String>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
