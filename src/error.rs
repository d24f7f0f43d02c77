//! Process-level error taxonomy.
//!
//! Startup failures are fatal and surface as [`Error`]. Failures while
//! releasing resources are collected as [`ReleaseError`] inside a
//! [`ShutdownReport`](crate::lifecycle::ShutdownReport) and never abort the
//! unwind.

use crate::bus::{BrokerKind, BusError};
use crate::component::IdentityError;
use crate::handler::HandlerError;
use crate::storage::StoreError;
use crate::transport::HostError;

/// Fatal process errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("could not initialize component: {0}")]
    IdentityInitFailed(#[source] IdentityError),

    #[error("could not initialize handler: {0}")]
    HandlerInitFailed(#[source] HandlerError),

    #[error("could not start {listener} listener: {source}")]
    ListenFailed {
        listener: &'static str,
        #[source]
        source: HostError,
    },

    #[error("could not start client for RPC proxy: {0}")]
    ProxyDialFailed(#[source] IdentityError),

    #[error("{listener} listener failed while serving: {message}")]
    ServeFailed {
        listener: &'static str,
        message: String,
    },
}

/// Result type for process orchestration.
pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal failure to release a resource during shutdown.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("failed to release store connection: {0}")]
    Store(#[source] StoreError),

    #[error("failed to detach {kind} broker: {source}")]
    Broker {
        kind: BrokerKind,
        #[source]
        source: BusError,
    },

    #[error("RPC server did not stop cleanly: {0}")]
    Server(#[source] HostError),

    #[error("HTTP proxy did not stop cleanly: {0}")]
    Proxy(String),
}
