//! AMQP (RabbitMQ) queue broker attachment.
//!
//! Uses a durable topic exchange; each message is published with the dotted
//! subject as routing key.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BrokerAttachment, BrokerCredentials, BrokerKind, BrokerSpec, BusError, Result};

/// Exchange used when the spec carries no routing key.
const DEFAULT_EXCHANGE: &str = "handler";

/// Connections kept by the pool.
const POOL_SIZE: usize = 4;

/// Build the AMQP connection URL for a target.
///
/// Full `amqp://`/`amqps://` URLs are used verbatim; bare `host:port`
/// targets get the credentials and the default vhost.
pub fn amqp_url(target: &str, credentials: &BrokerCredentials) -> String {
    if target.starts_with("amqp://") || target.starts_with("amqps://") {
        return target.to_string();
    }
    if credentials.is_empty() {
        format!("amqp://{}/%2f", target)
    } else {
        format!(
            "amqp://{}:{}@{}/%2f",
            credentials.username, credentials.password, target
        )
    }
}

/// AMQP attachment. Holds no connection until `connect` is called.
pub struct AmqpAttachment {
    target: String,
    url: String,
    exchange: String,
    pool: RwLock<Option<Pool>>,
    connected: AtomicBool,
}

impl AmqpAttachment {
    pub fn new(spec: &BrokerSpec) -> Self {
        Self {
            target: spec.target.clone(),
            url: amqp_url(&spec.target, &spec.credentials),
            exchange: spec
                .routing_key
                .clone()
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            pool: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Get a channel from the pool.
    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl BrokerAttachment for AmqpAttachment {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Queue
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<()> {
        let manager = Manager::new(self.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection and declare the exchange up front
        let channel = Self::get_channel(&pool).await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        *self.pool.write().await = Some(pool);
        self.connected.store(true, Ordering::SeqCst);

        info!(exchange = %self.exchange, target = %self.target, "Connected to AMQP");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let pool = self.pool.read().await.clone().ok_or(BusError::NotConnected)?;
        let channel = Self::get_channel(&pool).await?;

        let confirm = channel
            .basic_publish(
                &self.exchange,
                subject,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %self.exchange, routing_key = %subject, "Published to AMQP");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(pool) = self.pool.write().await.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);

        let closed = match pool.get().await {
            Ok(conn) => conn
                .close(200, "handler shutdown")
                .await
                .map_err(|e| BusError::Disconnect(e.to_string())),
            Err(e) => Err(BusError::Disconnect(e.to_string())),
        };
        // The pool is closed even when the graceful close failed.
        pool.close();
        closed?;

        info!(target = %self.target, "Disconnected from AMQP");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
