//! Job error types.

use docket_core::DocketError;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job handler raised during execution.
    #[error("Job handler failed: {0}")]
    Handler(String),

    /// The job was already attempted more times than allowed before it ran.
    #[error("A queued job has been attempted too many times ({attempts} of {max_tries}). The job may have previously timed out.")]
    MaxAttemptsExceeded { attempts: u32, max_tries: u32 },

    /// The handler did not finish in time.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// No handler is registered under the payload's job name.
    #[error("No handler registered for job: {0}")]
    HandlerNotFound(String),

    /// The stored payload could not be decoded.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// The job record does not exist.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The record lives on a different queue than the caller named.
    #[error("Job {id} is on queue '{actual}', not '{expected}'")]
    QueueMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// The detached child process could not be launched.
    #[error("Failed to launch job process: {0}")]
    Spawn(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage or configuration failure.
    #[error(transparent)]
    Storage(#[from] DocketError),
}

impl JobError {
    /// Creates a handler error from any displayable failure.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Returns true if the store could not be reached.
    #[must_use]
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::Storage(DocketError::StorageUnavailable(_)))
    }

    /// Returns true if this is a storage failure caused by a dropped connection.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_connection_lost(),
            _ => false,
        }
    }

    /// Returns true if the error came from the job itself rather than the queue.
    #[must_use]
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            Self::Handler(_)
                | Self::MaxAttemptsExceeded { .. }
                | Self::Timeout(_)
                | Self::HandlerNotFound(_)
                | Self::InvalidPayload(_)
        )
    }
}
