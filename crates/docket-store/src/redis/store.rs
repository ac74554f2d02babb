//! Document collections stored as Redis hashes.

use super::{storage_error, RedisKeys};
use crate::document::{Document, DocumentExt};
use crate::filter::{Filter, Sort, Update};
use crate::store::DocumentStore;
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use docket_core::{DocketError, DocketResult, DocumentId};
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Attempts at an optimistic transaction before giving up.
const MAX_TRANSACTION_RETRIES: usize = 32;

/// Redis-backed document store.
///
/// Each collection is one hash mapping `_id` to the JSON document. Filters
/// are evaluated client-side. Conditional writes run under `WATCH` on the
/// collection key and are retried when `EXEC` reports a concurrent write.
pub struct RedisDocumentStore {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisDocumentStore {
    /// Create a new Redis document store.
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> DocketResult<Connection> {
        self.pool.get().await.map_err(storage_error)
    }

    /// Loads every document of a collection in `_id` order.
    async fn load(conn: &mut Connection, key: &str) -> DocketResult<Vec<Document>> {
        let raw: HashMap<String, String> = conn.hgetall(key).await.map_err(storage_error)?;
        let mut docs = Vec::with_capacity(raw.len());
        for (id, json) in raw {
            match serde_json::from_str::<Document>(&json) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(key = %key, id = %id, error = %e, "Skipping undecodable document"),
            }
        }
        Sort::default().sort(&mut docs);
        Ok(docs)
    }

    async fn select(
        conn: &mut Connection,
        key: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> DocketResult<Vec<Document>> {
        let mut docs: Vec<Document> = Self::load(conn, key)
            .await?
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect();
        sort.sort(&mut docs);
        Ok(docs)
    }

    async fn watch(conn: &mut Connection, key: &str) -> DocketResult<()> {
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(&mut **conn)
            .await
            .map_err(storage_error)
    }

    async fn unwatch(conn: &mut Connection) -> DocketResult<()> {
        redis::cmd("UNWATCH")
            .query_async::<()>(&mut **conn)
            .await
            .map_err(storage_error)
    }

    /// Writes one document back under the active `WATCH`.
    ///
    /// Returns false when the transaction was aborted by a concurrent writer.
    async fn commit(conn: &mut Connection, key: &str, doc: &Document) -> DocketResult<bool> {
        let id = doc
            .id()
            .ok_or_else(|| DocketError::Serialization("Document without _id".to_string()))?;
        let json = serde_json::to_string(doc)?;

        let committed: Option<(i64,)> = redis::pipe()
            .atomic()
            .hset(key, id.to_string(), json)
            .query_async(&mut **conn)
            .await
            .map_err(storage_error)?;

        Ok(committed.is_some())
    }

    /// Runs a conditional update of the first match under `sort`.
    async fn modify_first(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        update: &Update,
    ) -> DocketResult<Option<Document>> {
        let key = self.keys.collection(collection);
        let mut conn = self.conn().await?;

        for attempt in 1..=MAX_TRANSACTION_RETRIES {
            Self::watch(&mut conn, &key).await?;

            let candidate = Self::select(&mut conn, &key, filter, sort)
                .await?
                .into_iter()
                .next();

            let Some(mut doc) = candidate else {
                Self::unwatch(&mut conn).await?;
                return Ok(None);
            };

            update.apply(&mut doc);
            if Self::commit(&mut conn, &key, &doc).await? {
                return Ok(Some(doc));
            }

            debug!(collection = %collection, attempt, "Concurrent write detected, retrying");
        }

        Err(DocketError::unavailable(format!(
            "Write contention on collection {collection} exceeded {MAX_TRANSACTION_RETRIES} retries"
        )))
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn insert_one(&self, collection: &str, mut doc: Document) -> DocketResult<DocumentId> {
        let id = doc.ensure_id()?;
        let json = serde_json::to_string(&doc)?;
        let mut conn = self.conn().await?;

        let _: i64 = conn
            .hset(self.keys.collection(collection), id.to_string(), json)
            .await
            .map_err(storage_error)?;

        Ok(id)
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> DocketResult<Vec<DocumentId>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(docs.len());
        let mut items = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = doc.ensure_id()?;
            items.push((id.to_string(), serde_json::to_string(&doc)?));
            ids.push(id);
        }

        let mut conn = self.conn().await?;
        let _: () = conn
            .hset_multiple(self.keys.collection(collection), &items)
            .await
            .map_err(storage_error)?;

        Ok(ids)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> DocketResult<Option<Document>> {
        let mut conn = self.conn().await?;
        let key = self.keys.collection(collection);
        Ok(Self::select(&mut conn, &key, filter, sort)
            .await?
            .into_iter()
            .next())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> DocketResult<Vec<Document>> {
        let mut conn = self.conn().await?;
        let key = self.keys.collection(collection);
        let mut docs = Self::select(&mut conn, &key, filter, sort).await?;
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> DocketResult<u64> {
        let mut conn = self.conn().await?;
        let key = self.keys.collection(collection);
        if *filter == Filter::All {
            let len: u64 = conn.hlen(&key).await.map_err(storage_error)?;
            return Ok(len);
        }
        let docs = Self::load(&mut conn, &key).await?;
        Ok(docs.iter().filter(|doc| filter.matches(doc)).count() as u64)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> DocketResult<bool> {
        let updated = self
            .modify_first(collection, filter, &Sort::default(), update)
            .await?;
        Ok(updated.is_some())
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        update: &Update,
    ) -> DocketResult<Option<Document>> {
        self.modify_first(collection, filter, sort, update).await
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> DocketResult<u64> {
        let key = self.keys.collection(collection);
        let mut conn = self.conn().await?;

        for attempt in 1..=MAX_TRANSACTION_RETRIES {
            Self::watch(&mut conn, &key).await?;

            let ids: Vec<String> = Self::load(&mut conn, &key)
                .await?
                .iter()
                .filter(|doc| filter.matches(doc))
                .filter_map(|doc| doc.id().map(|id| id.to_string()))
                .collect();

            if ids.is_empty() {
                Self::unwatch(&mut conn).await?;
                return Ok(0);
            }

            let removed: Option<(u64,)> = redis::pipe()
                .atomic()
                .hdel(&key, &ids)
                .query_async(&mut *conn)
                .await
                .map_err(storage_error)?;

            if let Some((count,)) = removed {
                return Ok(count);
            }

            debug!(collection = %collection, attempt, "Concurrent write detected, retrying remove");
        }

        Err(DocketError::unavailable(format!(
            "Write contention on collection {collection} exceeded {MAX_TRANSACTION_RETRIES} retries"
        )))
    }

    async fn ping(&self) -> DocketResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
