//! Error reporting at the worker loop boundary.

use crate::error::JobError;
use tracing::error;

/// Receives errors the worker loop caught instead of crashing on.
pub trait ErrorReporter: Send + Sync {
    /// Reports one error.
    fn report(&self, error: &JobError);
}

/// Reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &JobError) {
        if error.is_job_failure() {
            error!(error = %error, "Job raised an error");
        } else {
            error!(error = %error, connection_lost = error.is_connection_lost(), "Worker error");
        }
    }
}
