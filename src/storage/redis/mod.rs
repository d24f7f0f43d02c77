//! Redis store implementation.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{KvStore, Result, StoreError};
use crate::config::StoreConfig;

/// Redis-backed key-value store.
///
/// The connection manager is dropped on `close`; every later operation
/// fails with [`StoreError::Closed`].
pub struct RedisStore {
    conn: RwLock<Option<ConnectionManager>>,
    closed: AtomicBool,
    target: String,
}

impl RedisStore {
    /// Open a connection and check it with `PING`.
    ///
    /// The first connection attempt is made directly so an unreachable store
    /// fails at once; reconnects afterwards are the connection manager's job.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let mut probe = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut probe).await?;
        drop(probe);

        let conn = ConnectionManager::new(client).await?;

        let store = Self {
            conn: RwLock::new(Some(conn)),
            closed: AtomicBool::new(false),
            target: config.display_target(),
        };
        store.ping().await?;

        info!(target = %store.target, "Connected to Redis");
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn.read().await.clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(key, value).await?;
        debug!(key = %key, "Stored value in Redis");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(target = %self.target, "Redis connection already released");
            return Ok(());
        }
        self.conn.write().await.take();
        info!(target = %self.target, "Released Redis connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require Redis running
    // Run with: cargo test --features redis -- --ignored

    #[tokio::test]
    #[ignore = "requires running Redis instance"]
    async fn test_redis_store_roundtrip_and_close() {
        let store = RedisStore::connect(&StoreConfig::default())
            .await
            .expect("Failed to connect to Redis");

        let key = format!("handlerd:test:{}", uuid::Uuid::new_v4());
        store.set(&key, b"value".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"value".to_vec()));
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_redis_unreachable_fails_fast() {
        let config = StoreConfig {
            address: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        assert!(RedisStore::connect(&config).await.is_err());
    }
}
