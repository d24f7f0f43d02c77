//! NATS pub/sub broker attachment.
//!
//! Messages are published on the dotted subject handed to `publish`
//! (e.g. `my-app.devices.dev-1.up`).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BrokerAttachment, BrokerCredentials, BrokerKind, BrokerSpec, BusError, Result};

/// Client name announced to the NATS server.
const CLIENT_NAME: &str = "handlerd";

/// NATS attachment. Holds no connection until `connect` is called.
pub struct NatsAttachment {
    target: String,
    credentials: BrokerCredentials,
    client: RwLock<Option<async_nats::Client>>,
    connected: AtomicBool,
}

impl NatsAttachment {
    pub fn new(spec: &BrokerSpec) -> Self {
        Self {
            target: spec.target.clone(),
            credentials: spec.credentials.clone(),
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn options(&self) -> async_nats::ConnectOptions {
        let options = if self.credentials.is_empty() {
            async_nats::ConnectOptions::new()
        } else {
            async_nats::ConnectOptions::with_user_and_password(
                self.credentials.username.clone(),
                self.credentials.password.clone(),
            )
        };
        options.name(CLIENT_NAME)
    }
}

#[async_trait]
impl BrokerAttachment for NatsAttachment {
    fn kind(&self) -> BrokerKind {
        BrokerKind::PubSub
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<()> {
        let client = self
            .options()
            .connect(self.target.as_str())
            .await
            .map_err(|e| BusError::Connection(format!("NATS connect to {}: {}", self.target, e)))?;

        *self.client.write().await = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        info!(target = %self.target, "Connected to NATS");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;

        client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(subject = %subject, "Published to NATS");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);

        // Dropping the last client handle closes the connection; flush first
        // so already-accepted publishes reach the server.
        let flushed = client.flush().await;
        drop(client);
        flushed.map_err(|e| BusError::Disconnect(e.to_string()))?;

        info!(target = %self.target, "Disconnected from NATS");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
