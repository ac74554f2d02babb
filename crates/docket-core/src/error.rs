//! Unified error types for the storage, configuration, and queue layers.

use std::fmt::Debug;
use thiserror::Error;

/// Message fragments that identify a dropped or unusable store connection.
///
/// Matching is a plain substring test against the rendered error message.
pub const CONNECTION_LOST_PHRASES: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "Lost connection",
    "is dead or not enabled",
    "Error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "SSL connection has been closed unexpectedly",
    "Error writing data to the connection",
    "Resource deadlock avoided",
    "Transaction() on null",
];

/// Returns true if `message` contains one of the known connection-loss phrases.
#[must_use]
pub fn caused_by_lost_connection(message: &str) -> bool {
    CONNECTION_LOST_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
}

/// Unified error type for Docket.
#[derive(Error, Debug)]
pub enum DocketError {
    // ============ Storage Errors ============
    /// The document store could not be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A document lookup found nothing.
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// A stored document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ============ Configuration Errors ============
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DocketError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a storage-unavailable error.
    #[must_use]
    pub fn unavailable<T: Into<String>>(message: T) -> Self {
        Self::StorageUnavailable(message.into())
    }

    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is transient and the operation may be retried.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Checks if this is a storage failure caused by a dropped connection.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::StorageUnavailable(message) => caused_by_lost_connection(message),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DocketError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {err}"))
    }
}
