//! # Docket Store
//!
//! The document store the queue runs on. Only a minimal primitive set is
//! exposed: count, find, insert, single-document update, atomic
//! find-and-update, and remove, each over a named collection.
//!
//! ## Backends
//!
//! - [`MemoryDocumentStore`]: process-local collections behind a lock.
//! - [`RedisDocumentStore`]: one Redis hash per collection, shared by every
//!   worker process.

mod document;
mod filter;
mod memory;
pub mod redis;
mod store;

pub use document::*;
pub use filter::*;
pub use memory::MemoryDocumentStore;
pub use self::redis::RedisDocumentStore;
pub use store::*;

use docket_config::{StoreBackend, StoreConfig};
use docket_core::DocketResult;
use std::sync::Arc;
use tracing::info;

/// Builds the configured document store.
pub async fn connect(config: &StoreConfig) -> DocketResult<Arc<dyn DocumentStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        StoreBackend::Redis => {
            let pool = self::redis::create_pool(&config.redis).await?;
            Ok(Arc::new(RedisDocumentStore::new(
                pool,
                &config.redis.key_prefix,
            )))
        }
    }
}
