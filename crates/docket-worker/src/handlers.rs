//! Handlers shipped with the worker binary.

use async_trait::async_trait;
use docket_jobs::{HandlerRegistry, JobError, JobHandle, JobHandler, JobResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Logs its arguments and completes.
pub const LOG_JOB: &str = "log";

/// Always fails with its arguments as the reason.
pub const FAIL_JOB: &str = "fail";

/// Writes the job arguments to the log, then deletes the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogJob;

#[async_trait]
impl JobHandler for LogJob {
    async fn handle(&self, job: &mut JobHandle, data: Value) -> JobResult<()> {
        info!(job_id = %job.id(), attempts = job.attempts(), data = %data, "Log job");
        job.delete().await
    }
}

/// Fails every attempt. Useful to exercise retries and the failure log.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailJob;

#[async_trait]
impl JobHandler for FailJob {
    async fn handle(&self, _job: &mut JobHandle, data: Value) -> JobResult<()> {
        let reason = match data {
            Value::String(reason) => reason,
            Value::Null => "requested failure".to_string(),
            other => other.to_string(),
        };
        Err(JobError::Handler(reason))
    }
}

/// Registers the built-in handlers.
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register(LOG_JOB, Arc::new(LogJob));
    registry.register(FAIL_JOB, Arc::new(FailJob));
}
