//! Command line interface.

use clap::{Args, Parser, Subcommand};
use docket_jobs::dispatch::PROCESS_JOB_COMMAND;
use docket_jobs::WorkerOptions;

#[derive(Parser, Debug)]
#[command(name = "docket-worker")]
#[command(about = "Worker daemon and operator tools for Docket job queues")]
#[command(version)]
pub struct Cli {
    /// Directory holding default.toml and its overrides
    #[arg(long, short = 'c', default_value = "./config", env = "DOCKET_CONFIG_DIR", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll a connection and run its jobs until stopped
    Work(WorkArgs),

    /// Run one job by id, then exit
    #[command(name = PROCESS_JOB_COMMAND)]
    ProcessJob(ProcessJobArgs),

    /// Enqueue a job
    Push(PushArgs),

    /// Inspect and manage failed jobs
    Failed {
        #[command(subcommand)]
        action: FailedAction,
    },
}

#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Connection to work; defaults to the configured default connection
    pub connection: Option<String>,

    /// Comma-separated queues, earlier ones drained first
    #[arg(long, short = 'q')]
    pub queue: Option<String>,

    #[command(flatten)]
    pub options: OptionOverrides,
}

#[derive(Args, Debug)]
pub struct ProcessJobArgs {
    /// Job id
    #[arg(long)]
    pub id: String,

    /// Connection the job belongs to
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue the job was reserved from
    #[arg(long)]
    pub queue: Option<String>,

    #[command(flatten)]
    pub options: OptionOverrides,
}

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Registered handler name
    pub job: String,

    /// Handler arguments as JSON
    #[arg(long, default_value = "null")]
    pub data: String,

    /// Target queue
    #[arg(long, short = 'q')]
    pub queue: Option<String>,

    /// Target connection
    #[arg(long)]
    pub connection: Option<String>,

    /// Seconds before the job becomes available
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Per-job attempt ceiling
    #[arg(long)]
    pub max_tries: Option<u32>,

    /// Skip if an identical job is already queued
    #[arg(long)]
    pub unique: bool,
}

#[derive(Subcommand, Debug)]
pub enum FailedAction {
    /// List failed jobs, most recent first
    List,
    /// Show one failed job
    Show {
        /// Failed job id
        id: String,
    },
    /// Delete one failed job
    Forget {
        /// Failed job id
        id: String,
    },
    /// Delete every failed job
    Flush,
}

/// Worker settings given on the command line, layered over configuration.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct OptionOverrides {
    /// Seconds before a failed job is retried
    #[arg(long)]
    pub delay: Option<u64>,

    /// Memory ceiling in MiB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Seconds a job may run; 0 disables the limit
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to sleep when no job is available
    #[arg(long)]
    pub sleep: Option<u64>,

    /// Attempts before a job is failed; 0 means unlimited
    #[arg(long)]
    pub max_tries: Option<u32>,

    /// Stop when the store connection is lost
    #[arg(long)]
    pub stop_on_connection_lost: bool,
}

impl OptionOverrides {
    /// Applies the overrides on top of `base`.
    #[must_use]
    pub fn apply(&self, base: WorkerOptions) -> WorkerOptions {
        WorkerOptions {
            delay: self.delay.unwrap_or(base.delay),
            memory: self.memory.unwrap_or(base.memory),
            timeout: self.timeout.unwrap_or(base.timeout),
            sleep: self.sleep.unwrap_or(base.sleep),
            max_tries: self.max_tries.unwrap_or(base.max_tries),
            stop_on_connection_lost: self.stop_on_connection_lost || base.stop_on_connection_lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_layer_over_config() {
        let overrides = OptionOverrides {
            sleep: Some(0),
            max_tries: Some(5),
            ..OptionOverrides::default()
        };
        let options = overrides.apply(WorkerOptions::default());

        assert_eq!(options.sleep, 0);
        assert_eq!(options.max_tries, 5);
        assert_eq!(options.memory, 128);
        assert!(!options.stop_on_connection_lost);
    }
}
