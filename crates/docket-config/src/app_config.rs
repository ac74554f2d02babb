//! Application configuration structures.

use docket_core::{DocketError, DocketResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Document store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Connection used when a command does not name one.
    #[serde(default = "default_connection_name")]
    pub default_connection: String,

    /// Queue connections keyed by name.
    #[serde(default = "default_connections")]
    pub connections: HashMap<String, ConnectionConfig>,

    /// Failure log configuration.
    #[serde(default)]
    pub failed: FailedConfig,

    /// Default worker options.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Child process settings for process-per-job dispatch.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppMetadata::default(),
            store: StoreConfig::default(),
            default_connection: default_connection_name(),
            connections: default_connections(),
            failed: FailedConfig::default(),
            worker: WorkerConfig::default(),
            process: ProcessConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Looks up a connection by name.
    pub fn connection(&self, name: &str) -> DocketResult<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| DocketError::configuration(format!("Unknown queue connection: {name}")))
    }
}

fn default_connection_name() -> String {
    "default".to_string()
}

fn default_connections() -> HashMap<String, ConnectionConfig> {
    HashMap::from([(default_connection_name(), ConnectionConfig::default())])
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "docket".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Which document store implementation backs the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Useful for tests and single-process setups.
    #[default]
    Memory,
    /// Shared Redis store.
    Redis,
}

/// Document store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis settings, used when `backend = "redis"`.
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for every collection hash.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Returns the connect timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "docket".to_string()
}

/// How a claimed job is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run the handler inside the worker.
    #[default]
    Inline,
    /// Launch a detached child process per job.
    Process,
}

/// Admission control policy for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Count reserved jobs in the job's own queue.
    #[default]
    Queue,
    /// Count reserved jobs across every queue of the connection.
    Connection,
    /// Never throttle.
    Unlimited,
}

/// A named queue connection: one collection plus its locking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Collection holding the job records.
    #[serde(default = "default_table")]
    pub table: String,

    /// Queue used when a producer does not name one.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Visibility timeout in seconds.
    #[serde(default = "default_expire")]
    pub expire: u64,

    /// Maximum concurrently reserved jobs.
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Execution strategy.
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Scope of the reserved-job count.
    #[serde(default)]
    pub admission: AdmissionMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            queue: default_queue(),
            expire: default_expire(),
            limit: default_limit(),
            dispatch: DispatchMode::default(),
            admission: AdmissionMode::default(),
        }
    }
}

impl ConnectionConfig {
    /// Returns the visibility timeout as a Duration.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.expire)
    }
}

fn default_table() -> String {
    "docket_jobs".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_expire() -> u64 {
    60
}

fn default_limit() -> u64 {
    15
}

/// Failure log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedConfig {
    /// Collection holding failed job entries.
    #[serde(default = "default_failed_table")]
    pub table: String,
}

impl Default for FailedConfig {
    fn default() -> Self {
        Self {
            table: default_failed_table(),
        }
    }
}

fn default_failed_table() -> String {
    "docket_jobs_failed".to_string()
}

/// Worker defaults, overridable per invocation on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds to delay a failed job before it may be retried.
    #[serde(default)]
    pub delay: u64,

    /// Memory ceiling in MiB.
    #[serde(default = "default_memory")]
    pub memory: u64,

    /// Seconds an inline handler may run. Zero disables the limit.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds to sleep when no job is available.
    #[serde(default = "default_sleep")]
    pub sleep: u64,

    /// Attempts before a job is failed. Zero means unlimited.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Stop the worker when the store reports a lost connection.
    #[serde(default)]
    pub stop_on_connection_lost: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            delay: 0,
            memory: default_memory(),
            timeout: default_timeout(),
            sleep: default_sleep(),
            max_tries: default_max_tries(),
            stop_on_connection_lost: false,
        }
    }
}

fn default_memory() -> u64 {
    128
}

fn default_timeout() -> u64 {
    60
}

fn default_sleep() -> u64 {
    3
}

fn default_max_tries() -> u32 {
    1
}

/// Settings for the child process launched per job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Executable to launch. Defaults to the running executable.
    #[serde(default)]
    pub binary: Option<String>,

    /// Arguments placed before the sub-command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the child.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (json, pretty).
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Returns true when logs should be emitted as JSON lines.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}
