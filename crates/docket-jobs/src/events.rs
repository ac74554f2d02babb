//! Worker lifecycle hooks.
//!
//! Listeners are registered explicitly when the worker is built. Every hook
//! is fire-and-forget: nothing a listener does feeds back into the worker.

use crate::error::JobError;
use crate::job::JobHandle;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Observer of worker lifecycle events. Every hook defaults to a no-op.
pub trait WorkerListener: Send + Sync {
    /// A job is about to be processed.
    fn before_job(&self, _connection: &str, _job: &JobHandle) {}

    /// A job's handler returned normally.
    fn after_job(&self, _connection: &str, _job: &JobHandle) {}

    /// A job's handler failed and the job will be retried.
    fn exception_occurred(&self, _connection: &str, _job: &JobHandle, _error: &JobError) {}

    /// A job failed terminally and was moved to the failure log.
    fn job_failed(&self, _connection: &str, _job: &JobHandle, _error: &JobError) {}

    /// The worker is about to exit with `status`.
    fn worker_stopping(&self, _status: i32) {}
}

/// Fan-out of lifecycle events to registered listeners.
#[derive(Clone, Default)]
pub struct WorkerEvents {
    listeners: Vec<Arc<dyn WorkerListener>>,
}

impl WorkerEvents {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn WorkerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn before_job(&self, connection: &str, job: &JobHandle) {
        for listener in &self.listeners {
            listener.before_job(connection, job);
        }
    }

    pub(crate) fn after_job(&self, connection: &str, job: &JobHandle) {
        for listener in &self.listeners {
            listener.after_job(connection, job);
        }
    }

    pub(crate) fn exception_occurred(&self, connection: &str, job: &JobHandle, error: &JobError) {
        for listener in &self.listeners {
            listener.exception_occurred(connection, job, error);
        }
    }

    pub(crate) fn job_failed(&self, connection: &str, job: &JobHandle, error: &JobError) {
        for listener in &self.listeners {
            listener.job_failed(connection, job, error);
        }
    }

    pub(crate) fn worker_stopping(&self, status: i32) {
        for listener in &self.listeners {
            listener.worker_stopping(status);
        }
    }
}

/// Logs every lifecycle event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl WorkerListener for TracingListener {
    fn before_job(&self, connection: &str, job: &JobHandle) {
        debug!(
            connection = %connection,
            queue = %job.queue(),
            job_id = %job.id(),
            attempts = job.attempts(),
            "Processing job"
        );
    }

    fn after_job(&self, connection: &str, job: &JobHandle) {
        info!(connection = %connection, job_id = %job.id(), "Processed job");
    }

    fn exception_occurred(&self, connection: &str, job: &JobHandle, error: &JobError) {
        warn!(
            connection = %connection,
            job_id = %job.id(),
            attempts = job.attempts(),
            error = %error,
            "Job failed, will be retried"
        );
    }

    fn job_failed(&self, connection: &str, job: &JobHandle, error: &JobError) {
        error!(
            connection = %connection,
            queue = %job.queue(),
            job_id = %job.id(),
            attempts = job.attempts(),
            error = %error,
            "Job failed permanently"
        );
    }

    fn worker_stopping(&self, status: i32) {
        info!(status, "Worker stopping");
    }
}
