//! Shared utilities for integration tests.
//!
//! Provides injectable dependencies backed by the in-memory store and mock
//! broker attachments, all recording into one journal.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tonic::transport::Channel;

use handlerd::bus::{BrokerAttachment, BrokerKind, BrokerSpec, BusError, MockAttachment};
use handlerd::config::{Config, StoreConfig};
use handlerd::process::Dependencies;
use handlerd::storage::{KvStore, MemoryStore, StoreError};
use handlerd::test_utils::Journal;

pub use handlerd::proto::{
    application_manager_client::ApplicationManagerClient, handler_client::HandlerClient,
    Application, ApplicationIdentifier, UplinkMessage,
};

/// Dependencies handing out one in-memory store and one mock per broker kind.
#[derive(Clone)]
pub struct TestDependencies {
    pub journal: Journal,
    pub store: Arc<MemoryStore>,
    pub pubsub: Arc<MockAttachment>,
    pub queue: Arc<MockAttachment>,
    store_connects: Arc<AtomicUsize>,
    specs: Arc<Mutex<Vec<BrokerSpec>>>,
}

impl TestDependencies {
    pub fn new() -> Self {
        let journal = Journal::new();
        Self {
            store: Arc::new(MemoryStore::with_journal(journal.clone())),
            pubsub: Arc::new(MockAttachment::with_journal(
                BrokerKind::PubSub,
                journal.clone(),
            )),
            queue: Arc::new(MockAttachment::with_journal(
                BrokerKind::Queue,
                journal.clone(),
            )),
            journal,
            store_connects: Arc::new(AtomicUsize::new(0)),
            specs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of store connection attempts.
    pub fn store_connects(&self) -> usize {
        self.store_connects.load(Ordering::SeqCst)
    }

    /// Specs the orchestrator asked attachments for.
    pub fn specs(&self) -> Vec<BrokerSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dependencies for TestDependencies {
    async fn connect_store(&self, _config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
        self.store_connects.fetch_add(1, Ordering::SeqCst);
        self.store.ping().await?;
        Ok(self.store.clone())
    }

    fn attachment(&self, spec: &BrokerSpec) -> Result<Arc<dyn BrokerAttachment>, BusError> {
        self.specs.lock().unwrap().push(spec.clone());
        match spec.kind {
            BrokerKind::PubSub => Ok(self.pubsub.clone()),
            BrokerKind::Queue => Ok(self.queue.clone()),
        }
    }

    fn journal(&self) -> Option<Journal> {
        Some(self.journal.clone())
    }
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Whether something is listening on the loopback port.
///
/// Uses `SO_REUSEADDR` so connections left in TIME_WAIT do not count.
pub fn is_bound(port: u16) -> bool {
    let socket = tokio::net::TcpSocket::new_v4().expect("create socket");
    socket.set_reuseaddr(true).expect("set SO_REUSEADDR");
    if socket
        .bind(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
        .is_err()
    {
        return true;
    }
    socket.listen(1).is_err()
}

/// Loopback config with the RPC listener on a free port and no proxy.
pub fn test_config() -> Config {
    Config::for_test(free_port())
}

/// Loopback config with the proxy enabled on a free port.
pub fn test_config_with_proxy(access_keys: &[&str]) -> Config {
    let mut config = test_config();
    config.http.address = "127.0.0.1".to_string();
    config.http.port = free_port();
    config.http.access_keys = access_keys.iter().map(|k| k.to_string()).collect();
    config
}

pub async fn rpc_channel(addr: std::net::SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{}", addr))
        .expect("valid endpoint")
        .connect()
        .await
        .expect("connect to RPC server")
}

/// Attach `Bearer <token>` to a request.
pub fn with_token<T>(message: T, token: &str) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request.metadata_mut().insert(
        "authorization",
        format!("Bearer {}", token).parse().expect("ascii token"),
    );
    request
}
