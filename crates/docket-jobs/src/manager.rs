//! Connection registry and producer API.

use crate::error::JobResult;
use crate::job::Payload;
use crate::queue::DocumentQueue;
use docket_config::AppConfig;
use docket_core::{Clock, DocketError, DocumentId};
use docket_store::DocumentStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Every configured connection, built once from configuration and passed
/// to whoever needs it.
pub struct QueueManager {
    connections: HashMap<String, Arc<DocumentQueue>>,
    default_connection: String,
}

impl QueueManager {
    /// Builds a queue store for every configured connection.
    pub fn new(config: &AppConfig, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        let connections = config
            .connections
            .iter()
            .map(|(name, conn)| {
                let queue = DocumentQueue::new(
                    name.clone(),
                    conn.clone(),
                    Arc::clone(&store),
                    Arc::clone(&clock),
                );
                (name.clone(), Arc::new(queue))
            })
            .collect();

        Self {
            connections,
            default_connection: config.default_connection.clone(),
        }
    }

    /// Registers or replaces one connection.
    #[must_use]
    pub fn with_connection(mut self, queue: DocumentQueue) -> Self {
        self.connections
            .insert(queue.connection_name().to_string(), Arc::new(queue));
        self
    }

    /// Looks up a connection. `None` or an empty name means the default.
    pub fn connection(&self, name: Option<&str>) -> JobResult<Arc<DocumentQueue>> {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => &self.default_connection,
        };

        self.connections.get(name).cloned().ok_or_else(|| {
            DocketError::configuration(format!("Unknown queue connection: {name}")).into()
        })
    }

    /// Name of the default connection.
    #[must_use]
    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    /// Configured connection names, sorted.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueues a job.
    pub async fn push(
        &self,
        payload: &Payload,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<DocumentId> {
        self.connection(connection)?.push(payload, queue).await
    }

    /// Enqueues an already serialized payload.
    pub async fn push_raw(
        &self,
        payload: &str,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<DocumentId> {
        self.connection(connection)?.push_raw(payload, queue).await
    }

    /// Enqueues a job unless an identical one is already present.
    ///
    /// Returns `None` when the job was skipped. The check and the insert are
    /// separate store calls, so concurrent producers can still race.
    pub async fn push_unique(
        &self,
        payload: &Payload,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<Option<DocumentId>> {
        let store = self.connection(connection)?;
        if store.exists(payload, queue).await? {
            debug!(job = %payload.job, "Identical job already queued, skipping");
            return Ok(None);
        }
        store.push(payload, queue).await.map(Some)
    }

    /// Enqueues a job that becomes available after `delay` seconds.
    pub async fn later(
        &self,
        delay: u64,
        payload: &Payload,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<DocumentId> {
        self.connection(connection)?.later(delay, payload, queue).await
    }

    /// Delayed variant of [`QueueManager::push_unique`].
    pub async fn later_unique(
        &self,
        delay: u64,
        payload: &Payload,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<Option<DocumentId>> {
        let store = self.connection(connection)?;
        if store.exists(payload, queue).await? {
            debug!(job = %payload.job, "Identical job already queued, skipping");
            return Ok(None);
        }
        store.later(delay, payload, queue).await.map(Some)
    }

    /// Enqueues several jobs at once.
    pub async fn bulk(
        &self,
        payloads: &[Payload],
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<Vec<DocumentId>> {
        self.connection(connection)?.bulk(payloads, queue).await
    }

    /// Whether an identical job is present.
    pub async fn exists(
        &self,
        payload: &Payload,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> JobResult<bool> {
        self.connection(connection)?.exists(payload, queue).await
    }
}
