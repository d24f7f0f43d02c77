//! handlerd - application handler service
//!
//! Bootstraps the handler process: connects the Redis store, builds the
//! component identity, composes optional NATS/AMQP broker attachments, hosts
//! the handler's gRPC groups, optionally fronts them with an HTTP proxy, and
//! tears everything down in reverse order on SIGINT/SIGTERM.

pub mod auth;
pub mod bus;
pub mod component;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod process;
pub mod proxy;
pub mod storage;
pub mod test_utils;
pub mod transport;
pub mod utils;

pub use error::{Error, ReleaseError, Result};

pub mod proto {
    tonic::include_proto!("handlerd");
}
