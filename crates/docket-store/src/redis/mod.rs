//! Redis-backed document store.

mod store;

pub use store::RedisDocumentStore;

use docket_config::RedisConfig;
use docket_core::{DocketError, DocketResult};
use deadpool_redis::{Config, Pool, Runtime};
use std::fmt::Display;
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> DocketResult<Pool> {
    info!("Creating Redis connection pool for document store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| DocketError::configuration(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .create_timeout(Some(config.connect_timeout()))
        .wait_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| DocketError::configuration(format!("Failed to create pool: {e}")))?;

    // Test connection
    let mut conn = pool.get().await.map_err(storage_error)?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(storage_error)?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Maps a Redis or pool failure onto the storage error taxonomy.
pub(crate) fn storage_error(err: impl Display) -> DocketError {
    DocketError::unavailable(err.to_string())
}

/// Redis key builder for document collections.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Collection key (hash: document id -> JSON document).
    pub fn collection(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("docket")
    }
}
