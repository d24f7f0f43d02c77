//! Store connector.
//!
//! Persistent key-value storage backing the handler. Connections are
//! established and liveness-checked eagerly; this layer never retries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::StoreConfig;

pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use mock::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Store connection already released")]
    Closed,

    #[error("Backend not available: {0}")]
    Unsupported(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Key-value store owned by the handler.
///
/// `close` must be idempotent: the first call releases the connection, later
/// calls are no-ops.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Connect to the configured store and verify it answers.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    info!(target = %config.display_target(), "Connecting to store");

    #[cfg(feature = "redis")]
    {
        let store = RedisStore::connect(config).await.map_err(|e| {
            error!(target = %config.display_target(), error = %e, "Could not connect to store");
            e
        })?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    {
        error!("Redis store requested but 'redis' feature is not enabled");
        Err(StoreError::Unsupported("redis feature not enabled".to_string()))
    }
}
