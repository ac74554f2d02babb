//! In-process document store.

use crate::document::{Document, DocumentExt, ID_FIELD};
use crate::filter::{Filter, Sort, Update};
use crate::store::DocumentStore;
use async_trait::async_trait;
use docket_core::{DocketError, DocketResult, DocumentId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

type Collection = BTreeMap<String, Document>;

/// Document store held entirely in process memory.
///
/// Collections are keyed by `_id`, so unsorted iteration is already in
/// creation order. The store can be taken offline to exercise outage paths.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    online: AtomicBool,
}

impl MemoryDocumentStore {
    /// Creates an empty, online store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Switches the store on or off. While offline every call fails.
    pub fn set_online(&self, online: bool) {
        if !online {
            warn!("In-memory document store taken offline");
        }
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> DocketResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DocketError::unavailable(
                "no connection to the server (in-memory store offline)",
            ))
        }
    }

    fn matching(collection: &Collection, filter: &Filter, sort: &Sort) -> Vec<Document> {
        let mut docs: Vec<Document> = collection
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        sort.sort(&mut docs);
        docs
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_one(&self, collection: &str, mut doc: Document) -> DocketResult<DocumentId> {
        self.check_online()?;
        let id = doc.ensure_id()?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(id)
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> DocketResult<Vec<DocumentId>> {
        self.check_online()?;
        let mut prepared = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = doc.ensure_id()?;
            prepared.push((id, doc));
        }

        let mut collections = self.collections.write();
        let target = collections.entry(collection.to_string()).or_default();
        let ids = prepared.iter().map(|(id, _)| *id).collect();
        for (id, doc) in prepared {
            target.insert(id.to_string(), doc);
        }
        Ok(ids)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
    ) -> DocketResult<Option<Document>> {
        self.check_online()?;
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|c| Self::matching(c, filter, sort).into_iter().next()))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        limit: Option<usize>,
    ) -> DocketResult<Vec<Document>> {
        self.check_online()?;
        let collections = self.collections.read();
        let Some(c) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut docs = Self::matching(c, filter, sort);
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> DocketResult<u64> {
        self.check_online()?;
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |c| {
            c.values().filter(|doc| filter.matches(doc)).count() as u64
        }))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> DocketResult<bool> {
        self.check_online()?;
        let mut collections = self.collections.write();
        let Some(c) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match c.values_mut().find(|doc| filter.matches(doc)) {
            Some(doc) => {
                update.apply(doc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &Sort,
        update: &Update,
    ) -> DocketResult<Option<Document>> {
        self.check_online()?;
        let mut collections = self.collections.write();
        let Some(c) = collections.get_mut(collection) else {
            return Ok(None);
        };

        let selected = Self::matching(c, filter, sort)
            .into_iter()
            .next()
            .and_then(|doc| doc.get(ID_FIELD).and_then(|v| v.as_str()).map(str::to_string));

        Ok(selected.and_then(|key| {
            c.get_mut(&key).map(|doc| {
                update.apply(doc);
                doc.clone()
            })
        }))
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> DocketResult<u64> {
        self.check_online()?;
        let mut collections = self.collections.write();
        let Some(c) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = c.len();
        c.retain(|_, doc| !filter.matches(doc));
        Ok((before - c.len()) as u64)
    }

    async fn ping(&self) -> DocketResult<()> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_in_id_order() {
        let store = MemoryDocumentStore::new();
        let a = store.insert_one("c", doc(json!({"n": 1}))).await.unwrap();
        let b = store.insert_one("c", doc(json!({"n": 2}))).await.unwrap();

        let found = store.find("c", &Filter::All, &Sort::default(), None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id(), Some(a));
        assert_eq!(found[1].id(), Some(b));
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_updated() {
        let store = MemoryDocumentStore::new();
        store.insert_one("c", doc(json!({"n": 1, "hits": 0}))).await.unwrap();

        let updated = store
            .find_one_and_update(
                "c",
                &Filter::eq("n", 1),
                &Sort::default(),
                &Update::new().inc("hits", 1),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["hits"], json!(1));

        let missing = store
            .find_one_and_update("c", &Filter::eq("n", 9), &Sort::default(), &Update::new())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_count_and_remove() {
        let store = MemoryDocumentStore::new();
        store
            .insert_many(
                "c",
                vec![doc(json!({"q": "a"})), doc(json!({"q": "a"})), doc(json!({"q": "b"}))],
            )
            .await
            .unwrap();

        assert_eq!(store.count("c", &Filter::eq("q", "a")).await.unwrap(), 2);
        assert_eq!(store.remove("c", &Filter::eq("q", "a")).await.unwrap(), 2);
        assert_eq!(store.count("c", &Filter::All).await.unwrap(), 1);
        assert_eq!(store.count("other", &Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_one_reports_match() {
        let store = MemoryDocumentStore::new();
        let id = store.insert_one("c", doc(json!({"v": 1}))).await.unwrap();

        let hit = store
            .update_one("c", &Filter::by_id(id), &Update::new().set("v", 2))
            .await
            .unwrap();
        assert!(hit);

        let miss = store
            .update_one("c", &Filter::eq("v", 99), &Update::new().set("v", 3))
            .await
            .unwrap();
        assert!(!miss);
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryDocumentStore::new();
        store.set_online(false);

        let err = store.ping().await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(store.count("c", &Filter::All).await.is_err());

        store.set_online(true);
        assert!(store.ping().await.is_ok());
    }
}
