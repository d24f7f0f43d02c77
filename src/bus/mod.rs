//! Broker attachments.
//!
//! This module contains:
//! - `BrokerAttachment` trait: an optional connection to a message broker
//! - `BrokerSpec`: the pure description an attachment is built from
//! - Implementations: NATS (pub/sub), AMQP (queue), Mock
//!
//! Building an attachment never performs I/O; the connection is opened by
//! `connect`, which the handler calls during `init`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpAttachment;
pub use mock::MockAttachment;
#[cfg(feature = "nats")]
pub use nats::NatsAttachment;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    #[error("Attachment is not connected")]
    NotConnected,

    #[error("Broker support not compiled in: {0}")]
    Unsupported(BrokerKind),
}

// ============================================================================
// Attachment description
// ============================================================================

/// Broker kind. At most one attachment of each kind is held by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerKind {
    /// Publish/subscribe broker (NATS).
    PubSub,
    /// Queue broker with routed exchanges (AMQP).
    Queue,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::PubSub => f.write_str("pubsub"),
            BrokerKind::Queue => f.write_str("queue"),
        }
    }
}

/// Broker credentials. The password is redacted from `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pure description of one broker attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSpec {
    pub kind: BrokerKind,
    pub credentials: BrokerCredentials,
    /// Broker host and port (or full URL).
    pub target: String,
    /// Exchange for queue brokers.
    pub routing_key: Option<String>,
}

// ============================================================================
// Traits
// ============================================================================

/// An optional connection to an external message broker.
///
/// Implementations:
/// - `NatsAttachment`: NATS pub/sub
/// - `AmqpAttachment`: RabbitMQ via AMQP
/// - `MockAttachment`: In-memory mock for testing
#[async_trait]
pub trait BrokerAttachment: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Target for logging.
    fn target(&self) -> &str;

    /// Open the connection.
    async fn connect(&self) -> Result<()>;

    /// Publish a payload under a dotted subject (`<app>.devices.<dev>.up`).
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Close the connection. Calling it on a closed attachment is a no-op.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Build the attachment described by `spec` without connecting it.
pub fn attachment_for(spec: &BrokerSpec) -> Result<Arc<dyn BrokerAttachment>> {
    match spec.kind {
        #[cfg(feature = "nats")]
        BrokerKind::PubSub => Ok(Arc::new(NatsAttachment::new(spec))),
        #[cfg(feature = "amqp")]
        BrokerKind::Queue => Ok(Arc::new(AmqpAttachment::new(spec))),
        #[allow(unreachable_patterns)]
        kind => Err(BusError::Unsupported(kind)),
    }
}
