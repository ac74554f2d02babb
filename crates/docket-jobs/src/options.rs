//! Per-run worker options.

use docket_config::WorkerConfig;
use std::time::Duration;

/// Options a worker daemon runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Seconds before a failed job may be retried.
    pub delay: u64,

    /// Memory ceiling in MiB.
    pub memory: u64,

    /// Seconds an inline handler may run. Zero disables the limit.
    pub timeout: u64,

    /// Seconds to sleep when no job is available.
    pub sleep: u64,

    /// Attempts before a job is failed. Zero means unlimited.
    pub max_tries: u32,

    /// Stop when the store reports a lost connection.
    pub stop_on_connection_lost: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            memory: 128,
            timeout: 60,
            sleep: 3,
            max_tries: 1,
            stop_on_connection_lost: false,
        }
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            delay: config.delay,
            memory: config.memory,
            timeout: config.timeout,
            sleep: config.sleep,
            max_tries: config.max_tries,
            stop_on_connection_lost: config.stop_on_connection_lost,
        }
    }
}

impl WorkerOptions {
    /// Handler time limit, if any.
    #[must_use]
    pub const fn handler_timeout(&self) -> Option<Duration> {
        if self.timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout))
        }
    }

    /// Idle pause between empty polls.
    #[must_use]
    pub const fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep)
    }
}
