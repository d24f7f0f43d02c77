//! HTTP edge proxy.
//!
//! Translates REST requests into calls on the management RPC group over a
//! channel dialed back to this process, so proxied calls go through the same
//! authorization path as any external RPC caller. Present only when both an
//! HTTP address and a non-zero port are configured.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::TokenValidator;
use crate::component::Component;
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::lifecycle::FatalSignal;
use crate::proto::application_manager_client::ApplicationManagerClient;
use crate::transport::HostError;

mod routes;

pub use routes::{router, status_to_http, ApplicationBody, ErrorBody, ProxyState};

/// Listener name used in logs and errors.
pub const LISTENER: &str = "http";

/// Whether the proxy should be started at all.
pub fn is_enabled(config: &HttpConfig) -> bool {
    config.is_enabled()
}

/// Running HTTP proxy.
pub struct EdgeProxy {
    local_addr: SocketAddr,
    context: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EdgeProxy {
    /// Dial this process, bind the HTTP listener and start serving.
    ///
    /// The accept loop runs on its own task. A failure after startup trips
    /// `fatal`.
    pub async fn start(
        config: &HttpConfig,
        component: &Component,
        validator: Arc<dyn TokenValidator>,
        fatal: FatalSignal,
    ) -> Result<Self> {
        let channel = component.dial().map_err(Error::ProxyDialFailed)?;
        let limit = component.max_message_size();
        let client = ApplicationManagerClient::with_interceptor(channel, component.interceptor())
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        info!(target = %component.announce_address(), "Proxy dialed RPC server");

        let address = config.listen_addr();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| Error::ListenFailed {
                listener: LISTENER,
                source: HostError::Bind {
                    address: address.clone(),
                    source,
                },
            })?;
        let local_addr = listener.local_addr().map_err(|source| Error::ListenFailed {
            listener: LISTENER,
            source: HostError::Bind {
                address: address.clone(),
                source,
            },
        })?;

        let context = CancellationToken::new();
        let app = router(ProxyState::new(client, validator));
        let shutdown = context.clone();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP proxy error");
                fatal.trip(LISTENER, e.to_string());
            }
        });

        info!(address = %local_addr, "HTTP proxy listening");
        Ok(Self {
            local_addr,
            context,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Context governing the proxy's background work.
    pub fn context(&self) -> CancellationToken {
        self.context.clone()
    }

    /// Cancel the proxy context and wait for the accept loop to end.
    ///
    /// With a grace period, the loop is aborted once it elapses. A second
    /// call is a no-op.
    pub async fn stop(&mut self, grace: Option<Duration>) -> std::result::Result<(), String> {
        self.context.cancel();
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        let joined = match grace {
            Some(limit) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(grace = ?limit, "HTTP proxy drain timed out, aborting");
                        abort.abort();
                        return Err(format!("drain did not finish within {:?}", limit));
                    }
                }
            }
            None => task.await,
        };

        joined.map_err(|e| e.to_string())?;
        info!("HTTP proxy stopped");
        Ok(())
    }
}

impl Drop for EdgeProxy {
    fn drop(&mut self) {
        self.context.cancel();
    }
}
