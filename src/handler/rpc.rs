//! Primary application RPC group.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{debug, error, warn};

use super::manager::application_key;
use crate::bus::BrokerAttachment;
use crate::proto::handler_server::Handler as HandlerTrait;
use crate::proto::{Ack, UplinkMessage};
use crate::storage::KvStore;

/// Subject an uplink is published under.
pub fn uplink_subject(app_id: &str, dev_id: &str) -> String {
    format!("{}.devices.{}.up", app_id, dev_id)
}

/// Uplink as published to broker attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkEvent {
    pub app_id: String,
    pub dev_id: String,
    pub port: u32,
    /// Base64-encoded payload.
    pub payload: String,
    pub upstream_id: String,
    pub handler_id: String,
}

/// Implements the `Handler` service group.
pub struct HandlerRpc {
    store: Arc<dyn KvStore>,
    attachments: Vec<Arc<dyn BrokerAttachment>>,
    upstream_id: String,
    handler_id: String,
}

impl HandlerRpc {
    pub fn new(
        store: Arc<dyn KvStore>,
        attachments: Vec<Arc<dyn BrokerAttachment>>,
        upstream_id: String,
        handler_id: String,
    ) -> Self {
        Self {
            store,
            attachments,
            upstream_id,
            handler_id,
        }
    }
}

#[tonic::async_trait]
impl HandlerTrait for HandlerRpc {
    async fn handle_uplink(&self, request: Request<UplinkMessage>) -> Result<Response<Ack>, Status> {
        let uplink = request.into_inner();
        if uplink.app_id.is_empty() || uplink.dev_id.is_empty() {
            return Err(Status::invalid_argument("uplink needs app_id and dev_id"));
        }
        // Empty means the direct upstream peer.
        if !uplink.upstream_id.is_empty() && uplink.upstream_id != self.upstream_id {
            warn!(upstream = %uplink.upstream_id, "Uplink from unknown upstream");
            return Err(Status::permission_denied(format!(
                "upstream '{}' is not allowed",
                uplink.upstream_id
            )));
        }

        let registered = self
            .store
            .get(&application_key(&uplink.app_id))
            .await
            .map_err(|e| {
                error!(app_id = %uplink.app_id, error = %e, "Application lookup failed");
                Status::unavailable(e.to_string())
            })?;
        if registered.is_none() {
            return Err(Status::not_found(format!(
                "application '{}' is not registered",
                uplink.app_id
            )));
        }

        let subject = uplink_subject(&uplink.app_id, &uplink.dev_id);
        let event = UplinkEvent {
            payload: BASE64.encode(&uplink.payload),
            app_id: uplink.app_id,
            dev_id: uplink.dev_id,
            port: uplink.port,
            upstream_id: self.upstream_id.clone(),
            handler_id: self.handler_id.clone(),
        };
        let body = Bytes::from(
            serde_json::to_vec(&event).map_err(|e| Status::internal(e.to_string()))?,
        );

        let mut failures = Vec::new();
        for attachment in &self.attachments {
            if let Err(e) = attachment.publish(&subject, body.clone()).await {
                error!(kind = %attachment.kind(), subject = %subject, error = %e, "Publish failed");
                failures.push(format!("{}: {}", attachment.kind(), e));
            }
        }
        if !failures.is_empty() {
            return Err(Status::unavailable(failures.join("; ")));
        }

        debug!(subject = %subject, attachments = self.attachments.len(), "Uplink handled");
        Ok(Response::new(Ack {}))
    }
}
