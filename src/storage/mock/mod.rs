//! In-memory store for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KvStore, Result, StoreError};
use crate::test_utils::Journal;

/// In-memory key-value store.
///
/// Failure injection and a release counter make it usable for startup and
/// shutdown tests; an optional [`Journal`] records `store.close`.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
    unreachable: AtomicBool,
    fail_on_close: AtomicBool,
    closed: AtomicBool,
    releases: AtomicUsize,
    journal: Option<Journal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    /// Make `ping` (and therefore connecting) fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_on_close(&self, fail: bool) {
        self.fail_on_close.store(fail, Ordering::SeqCst);
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst)
    }

    /// Number of times the connection was actually released.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_open()?;
        if self.is_unreachable() {
            return Err(StoreError::Connection("Mock store unreachable".to_string()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record("store.close");
        }
        if self.fail_on_close.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("Mock close failure".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
