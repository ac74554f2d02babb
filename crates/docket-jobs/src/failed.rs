//! Failure log (dead-letter store) for terminally failed jobs.

use crate::error::JobResult;
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docket_core::{Clock, DocumentId};
use docket_store::{Document, DocumentStore, Filter, Sort, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// One terminally failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    /// Entry id.
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// Connection the job ran on.
    pub connection: String,
    /// Queue the job came from.
    pub queue: String,
    /// Raw payload as it was stored on the queue.
    pub payload: String,
    /// Failure reason.
    pub exception: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Append-only store of failed jobs.
#[async_trait]
pub trait FailedJobProvider: Send + Sync {
    /// Records a failed job.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
    ) -> JobResult<DocumentId>;

    /// All entries, most recent first.
    async fn all(&self) -> JobResult<Vec<FailedJob>>;

    /// One entry by id.
    async fn find(&self, id: DocumentId) -> JobResult<Option<FailedJob>>;

    /// Deletes one entry. Returns whether it existed.
    async fn forget(&self, id: DocumentId) -> JobResult<bool>;

    /// Deletes every entry. Returns how many were removed.
    async fn flush(&self) -> JobResult<u64>;
}

/// Failure log kept in a document store collection.
pub struct DocumentFailedJobProvider {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    table: String,
}

impl DocumentFailedJobProvider {
    /// Creates a provider writing to `table`.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, table: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            table: table.into(),
        }
    }

    fn decode(doc: Document) -> JobResult<FailedJob> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

#[async_trait]
impl FailedJobProvider for DocumentFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
    ) -> JobResult<DocumentId> {
        let mut doc = Document::new();
        doc.insert("connection".to_string(), Value::from(connection));
        doc.insert("queue".to_string(), Value::from(queue));
        doc.insert("payload".to_string(), Value::from(payload));
        doc.insert("exception".to_string(), Value::from(exception));
        doc.insert(
            "failed_at".to_string(),
            serde_json::to_value(self.clock.now())?,
        );

        let id = self.store.insert_one(&self.table, doc).await?;
        JobMetrics::job_dead_lettered(connection, queue);
        info!(failed_id = %id, connection = %connection, queue = %queue, "Logged failed job");
        Ok(id)
    }

    async fn all(&self) -> JobResult<Vec<FailedJob>> {
        let docs = self
            .store
            .find(&self.table, &Filter::All, &Sort::desc(ID_FIELD), None)
            .await?;
        docs.into_iter().map(Self::decode).collect()
    }

    async fn find(&self, id: DocumentId) -> JobResult<Option<FailedJob>> {
        let doc = self
            .store
            .find_one(&self.table, &Filter::by_id(id), &Sort::default())
            .await?;
        doc.map(Self::decode).transpose()
    }

    async fn forget(&self, id: DocumentId) -> JobResult<bool> {
        Ok(self.store.remove(&self.table, &Filter::by_id(id)).await? > 0)
    }

    async fn flush(&self) -> JobResult<u64> {
        let removed = self.store.remove(&self.table, &Filter::All).await?;
        info!(removed, "Flushed failed jobs");
        Ok(removed)
    }
}
