//! The document store abstraction.

use crate::document::Document;
use crate::filter::{Filter, Sort, Update};
use async_trait::async_trait;
use docket_core::{DocketResult, DocumentId};

/// Minimal document store primitives.
///
/// Every method fails with `DocketError::StorageUnavailable` when the
/// backend cannot be reached. Single-document mutations are atomic.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a document, assigning `_id` when absent.
    async fn insert_one(&self, collection: &str, doc: Document) -> DocketResult<DocumentId>;

    /// Inserts a batch of documents in one operation.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>)
        -> DocketResult<Vec<DocumentId>>;

    /// Returns the first matching document under `sort`.
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> DocketResult<Option<Document>>;

    /// Returns every matching document under `sort`, up to `limit`.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> DocketResult<Vec<Document>>;

    /// Counts matching documents.
    async fn count(&self, collection: &str, filter: &Filter) -> DocketResult<u64>;

    /// Applies `update` to the first matching document (by `_id` order).
    ///
    /// Returns whether a document matched.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> DocketResult<bool>;

    /// Atomically selects the first match under `sort`, applies `update`,
    /// and returns the updated document.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        update: &Update,
    ) -> DocketResult<Option<Document>>;

    /// Removes every matching document. Returns how many were removed.
    async fn remove(&self, collection: &str, filter: &Filter) -> DocketResult<u64>;

    /// Verifies the backend is reachable.
    async fn ping(&self) -> DocketResult<()>;
}
