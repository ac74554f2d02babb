//! Job handlers and their registry.

use crate::error::JobResult;
use crate::job::JobHandle;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Business logic behind a job name.
///
/// A handler that finishes its work should call [`JobHandle::delete`];
/// the worker never deletes a job on the handler's behalf. Returning an
/// error sends the job through retry/failure classification.
///
/// # Example
///
/// ```rust,ignore
/// struct SendMail;
///
/// #[async_trait::async_trait]
/// impl JobHandler for SendMail {
///     async fn handle(&self, job: &mut JobHandle, data: Value) -> JobResult<()> {
///         mailer::send(&data).await.map_err(JobError::handler)?;
///         job.delete().await
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs before every execution, e.g. to refresh a stale connection.
    async fn prepare(&self) -> JobResult<()> {
        Ok(())
    }

    /// Executes the job with its decoded arguments.
    async fn handle(&self, job: &mut JobHandle, data: Value) -> JobResult<()>;
}

/// Handlers keyed by job name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        info!(job = %name, "Registered job handler");
        self.handlers.write().insert(name, handler);
    }

    /// Looks up a handler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Registered job names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
