//! # Docket Worker
//!
//! The `docket-worker` binary: the worker daemon, the `process-job` entry
//! point used by process-per-job dispatch, and operator commands for
//! enqueueing jobs and managing the failure log.

pub mod app;
pub mod cli;
pub mod handlers;
pub mod startup;

pub use app::App;
pub use cli::{Cli, Command};
