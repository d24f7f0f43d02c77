//! Mock broker attachment for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BrokerAttachment, BrokerKind, BusError, Result};
use crate::test_utils::Journal;

/// Mock attachment recording published messages.
///
/// Records `<kind>.connect` and `<kind>.disconnect` into the optional
/// journal.
pub struct MockAttachment {
    kind: BrokerKind,
    target: String,
    connected: AtomicBool,
    fail_on_connect: AtomicBool,
    fail_on_publish: AtomicBool,
    fail_on_disconnect: AtomicBool,
    disconnects: AtomicUsize,
    published: RwLock<Vec<(String, Bytes)>>,
    journal: Option<Journal>,
}

impl MockAttachment {
    pub fn new(kind: BrokerKind) -> Self {
        Self {
            kind,
            target: format!("mock://{}", kind),
            connected: AtomicBool::new(false),
            fail_on_connect: AtomicBool::new(false),
            fail_on_publish: AtomicBool::new(false),
            fail_on_disconnect: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            published: RwLock::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_journal(kind: BrokerKind, journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(kind)
        }
    }

    pub fn set_fail_on_connect(&self, fail: bool) {
        self.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_disconnect(&self, fail: bool) {
        self.fail_on_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Number of times the connection was actually closed.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.read().await.clone()
    }

    fn record(&self, action: &str) {
        if let Some(journal) = &self.journal {
            journal.record(format!("{}.{}", self.kind, action));
        }
    }
}

#[async_trait]
impl BrokerAttachment for MockAttachment {
    fn kind(&self) -> BrokerKind {
        self.kind
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_on_connect.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock connect failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.record("connect");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((subject.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.record("disconnect");
        if self.fail_on_disconnect.load(Ordering::SeqCst) {
            return Err(BusError::Disconnect("Mock disconnect failure".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
