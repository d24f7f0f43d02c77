//! Handler core.
//!
//! The [`Handler`] owns the store connection and every broker attachment.
//! Attachments are composed before any I/O with [`Handler::with_broker`];
//! all connecting happens in [`Handler::init`].
//!
//! ```text
//! Uninitialized -> Initializing -> Initialized -> Serving -> ShuttingDown -> Stopped
//!       ^               |
//!       +---- failed ---+
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tonic::server::NamedService;
use tracing::{debug, info, warn};

use crate::auth::{AccessKeys, TokenValidator};
use crate::bus::{BrokerAttachment, BrokerKind, BusError};
use crate::component::Component;
use crate::error::ReleaseError;
use crate::proto::application_manager_server::ApplicationManagerServer;
use crate::proto::handler_server::HandlerServer;
use crate::storage::{KvStore, StoreError};
use crate::transport::{HostError, ServiceHost};

mod manager;
mod rpc;

pub use manager::{application_key, validate_app_id, ApplicationRecord, ManagerRpc};
pub use rpc::{uplink_subject, HandlerRpc, UplinkEvent};

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Initializing,
    Initialized,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerState::Uninitialized => "uninitialized",
            HandlerState::Initializing => "initializing",
            HandlerState::Initialized => "initialized",
            HandlerState::Serving => "serving",
            HandlerState::ShuttingDown => "shutting-down",
            HandlerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors raised by the handler core.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler is {actual}, expected {expected}")]
    InvalidState {
        actual: HandlerState,
        expected: HandlerState,
    },

    #[error("upstream peer identifier is empty")]
    MissingUpstream,

    #[error("store is not reachable: {0}")]
    Store(#[source] StoreError),

    #[error("could not attach {kind} broker at {target}: {source}")]
    Broker {
        kind: BrokerKind,
        target: String,
        #[source]
        source: BusError,
    },

    #[error("could not register {group}: {source}")]
    Register {
        group: &'static str,
        #[source]
        source: HostError,
    },
}

/// Business-logic handler hosted by this process.
pub struct Handler {
    store: Arc<dyn KvStore>,
    upstream_id: String,
    attachments: Vec<Arc<dyn BrokerAttachment>>,
    validator: Arc<dyn TokenValidator>,
    state: RwLock<HandlerState>,
    component: RwLock<Option<Arc<Component>>>,
}

impl Handler {
    pub fn new(store: Arc<dyn KvStore>, upstream_id: impl Into<String>) -> Self {
        Self {
            store,
            upstream_id: upstream_id.into(),
            attachments: Vec::new(),
            validator: Arc::new(AccessKeys::default()),
            state: RwLock::new(HandlerState::Uninitialized),
            component: RwLock::new(None),
        }
    }

    /// Add a broker attachment. No connection is made here.
    ///
    /// An attachment of the same kind replaces the previous one.
    pub fn with_broker(mut self, attachment: Arc<dyn BrokerAttachment>) -> Self {
        let kind = attachment.kind();
        self.attachments.retain(|a| a.kind() != kind);
        debug!(kind = %kind, target = %attachment.target(), "Broker attachment composed");
        self.attachments.push(attachment);
        self
    }

    /// Token validator used by the management group.
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn state(&self) -> HandlerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kinds of the composed attachments, in composition order.
    pub fn attachments(&self) -> Vec<BrokerKind> {
        self.attachments.iter().map(|a| a.kind()).collect()
    }

    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    /// Bind the handler to the process identity and connect its dependencies.
    ///
    /// On failure every attachment connected so far is disconnected again
    /// and the handler returns to `Uninitialized`. The store stays owned by
    /// the caller's release path.
    pub async fn init(&self, component: Arc<Component>) -> Result<(), HandlerError> {
        self.transition(HandlerState::Uninitialized, HandlerState::Initializing)?;

        match self.connect_dependencies().await {
            Ok(()) => {
                *self
                    .component
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(component);
                self.set_state(HandlerState::Initialized);
                info!(
                    upstream = %self.upstream_id,
                    attachments = self.attachments.len(),
                    "Handler initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(HandlerState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn connect_dependencies(&self) -> Result<(), HandlerError> {
        if self.upstream_id.is_empty() {
            return Err(HandlerError::MissingUpstream);
        }
        self.store.ping().await.map_err(HandlerError::Store)?;

        let mut connected: Vec<&Arc<dyn BrokerAttachment>> = Vec::new();
        for attachment in &self.attachments {
            if let Err(source) = attachment.connect().await {
                for done in connected.iter().rev() {
                    if let Err(e) = done.disconnect().await {
                        warn!(kind = %done.kind(), error = %e, "Rollback disconnect failed");
                    }
                }
                return Err(HandlerError::Broker {
                    kind: attachment.kind(),
                    target: attachment.target().to_string(),
                    source,
                });
            }
            info!(kind = %attachment.kind(), target = %attachment.target(), "Broker attached");
            connected.push(attachment);
        }
        Ok(())
    }

    /// Register the primary application RPC group.
    pub fn register_rpc(&self, host: &mut ServiceHost) -> Result<(), HandlerError> {
        let component = self.initialized_component()?;
        let limit = component.max_message_size();
        let rpc = HandlerRpc::new(
            self.store.clone(),
            self.attachments.clone(),
            self.upstream_id.clone(),
            component.id().to_string(),
        );
        let group = <HandlerServer<HandlerRpc> as NamedService>::NAME;

        host.register(group, move |routes| {
            routes.add_service(
                HandlerServer::new(rpc)
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            );
        })
        .map_err(|source| HandlerError::Register { group, source })
    }

    /// Register the management RPC group.
    pub fn register_manager(&self, host: &mut ServiceHost) -> Result<(), HandlerError> {
        let component = self.initialized_component()?;
        let limit = component.max_message_size();
        let manager = ManagerRpc::new(self.store.clone(), self.validator.clone());
        let group = <ApplicationManagerServer<ManagerRpc> as NamedService>::NAME;

        host.register(group, move |routes| {
            routes.add_service(
                ApplicationManagerServer::new(manager)
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            );
        })
        .map_err(|source| HandlerError::Register { group, source })
    }

    /// Mark the handler as serving once its groups are live.
    pub fn begin_serving(&self) -> Result<(), HandlerError> {
        self.transition(HandlerState::Initialized, HandlerState::Serving)?;
        info!("Handler serving");
        Ok(())
    }

    /// Release every broker attachment and the store connection.
    ///
    /// Every release is attempted even when an earlier one fails; failures
    /// are returned, not raised. Only the first call releases anything.
    pub async fn shutdown(&self) -> Vec<ReleaseError> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match *state {
                HandlerState::ShuttingDown | HandlerState::Stopped => {
                    debug!(state = %*state, "Handler shutdown already done");
                    return Vec::new();
                }
                _ => *state = HandlerState::ShuttingDown,
            }
        }
        info!("Handler shutting down");

        let mut errors = Vec::new();
        for attachment in self.attachments.iter().rev() {
            match attachment.disconnect().await {
                Ok(()) => info!(kind = %attachment.kind(), "Broker detached"),
                Err(source) => errors.push(ReleaseError::Broker {
                    kind: attachment.kind(),
                    source,
                }),
            }
        }
        match self.store.close().await {
            Ok(()) => info!("Store connection released"),
            Err(e) => errors.push(ReleaseError::Store(e)),
        }

        self.set_state(HandlerState::Stopped);
        info!(failures = errors.len(), "Handler stopped");
        errors
    }

    fn initialized_component(&self) -> Result<Arc<Component>, HandlerError> {
        let state = self.state();
        if state != HandlerState::Initialized {
            return Err(HandlerError::InvalidState {
                actual: state,
                expected: HandlerState::Initialized,
            });
        }
        self.component
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HandlerError::InvalidState {
                actual: state,
                expected: HandlerState::Initialized,
            })
    }

    fn transition(&self, from: HandlerState, to: HandlerState) -> Result<(), HandlerError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(HandlerError::InvalidState {
                actual: *state,
                expected: from,
            });
        }
        *state = to;
        debug!(from = %from, to = %to, "Handler state changed");
        Ok(())
    }

    fn set_state(&self, to: HandlerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = to;
    }
}
