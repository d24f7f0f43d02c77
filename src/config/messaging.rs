//! Broker attachment configuration types.
//!
//! Each broker is enabled only when its `target` is non-empty.

use serde::Deserialize;

use crate::bus::{BrokerCredentials, BrokerKind, BrokerSpec};

/// Primary pub/sub broker (NATS) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Broker host and port; empty disables the attachment.
    pub target: String,
    pub username: String,
    pub password: String,
}

impl PubSubConfig {
    pub fn is_enabled(&self) -> bool {
        !self.target.is_empty()
    }
}

/// Secondary queue broker (AMQP) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Broker host and port; empty disables the attachment.
    pub target: String,
    pub username: String,
    pub password: String,
    /// Exchange that receives published messages.
    pub exchange: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "handler".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn is_enabled(&self) -> bool {
        !self.target.is_empty()
    }
}

/// Upstream peer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Identifier of the upstream broker as announced in discovery.
    pub broker_id: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            broker_id: "dev".to_string(),
        }
    }
}

/// Build the attachment specs for every enabled broker.
///
/// Pure: no connection is attempted here.
pub fn broker_specs(pubsub: &PubSubConfig, queue: &QueueConfig) -> Vec<BrokerSpec> {
    let mut specs = Vec::new();
    if pubsub.is_enabled() {
        specs.push(BrokerSpec {
            kind: BrokerKind::PubSub,
            credentials: BrokerCredentials::new(&pubsub.username, &pubsub.password),
            target: pubsub.target.clone(),
            routing_key: None,
        });
    }
    if queue.is_enabled() {
        specs.push(BrokerSpec {
            kind: BrokerKind::Queue,
            credentials: BrokerCredentials::new(&queue.username, &queue.password),
            target: queue.target.clone(),
            routing_key: Some(queue.exchange.clone()),
        });
    }
    specs
}
