//! RPC service host.
//!
//! Owns the RPC listener and the service groups registered on it.
//!
//! ```text
//! Unbound --bind--> Listening --serve--> Serving --stop--> Stopped
//!    |                  |                                    ^
//!    +------------------+----------------stop----------------+
//! ```
//!
//! Service groups are registered before `serve`; the accept loop runs on its
//! own task so the caller continues immediately.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::lifecycle::FatalSignal;

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unbound,
    Listening,
    Serving,
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Unbound => "unbound",
            HostState::Listening => "listening",
            HostState::Serving => "serving",
            HostState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors raised by the service host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service group '{0}' is already registered")]
    AlreadyRegistered(&'static str),

    #[error("operation not allowed while host is {0}")]
    InvalidState(HostState),

    #[error("RPC server task failed: {0}")]
    Task(String),

    #[error("RPC server did not drain within {0:?}")]
    DrainTimeout(Duration),
}

/// Running accept loop.
struct ServerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

/// Owner of the RPC listener and its registered service groups.
pub struct ServiceHost {
    name: &'static str,
    state: HostState,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    routes: RoutesBuilder,
    groups: Vec<&'static str>,
    health: Option<HealthReporter>,
    server: Option<ServerHandle>,
}

impl ServiceHost {
    /// Create an unbound host. `name` labels logs and fatal-serve reports.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: HostState::Unbound,
            listener: None,
            local_addr: None,
            routes: RoutesBuilder::default(),
            groups: Vec::new(),
            health: None,
            server: None,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Registered service group names, in registration order.
    pub fn groups(&self) -> &[&'static str] {
        &self.groups
    }

    /// Bind the listener (`host:port`).
    pub async fn bind(&mut self, address: &str) -> Result<SocketAddr, HostError> {
        if self.state != HostState::Unbound {
            return Err(HostError::InvalidState(self.state));
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| HostError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| HostError::Bind {
            address: address.to_string(),
            source,
        })?;

        info!(service = %self.name, address = %local_addr, "Listener bound");
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.state = HostState::Listening;
        Ok(local_addr)
    }

    /// Register a service group. Only allowed before `serve`, once per group.
    pub fn register<F>(&mut self, group: &'static str, add: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        match self.state {
            HostState::Unbound | HostState::Listening => {}
            state => return Err(HostError::InvalidState(state)),
        }
        if self.groups.contains(&group) {
            return Err(HostError::AlreadyRegistered(group));
        }

        add(&mut self.routes);
        self.groups.push(group);
        debug!(service = %self.name, group = %group, "Service group registered");
        Ok(())
    }

    /// Start the accept loop on its own task and return immediately.
    ///
    /// The standard health service is added alongside the registered groups.
    /// If the loop later fails, `fatal` is tripped.
    pub async fn serve(&mut self, server: Server, fatal: FatalSignal) -> Result<(), HostError> {
        if self.state != HostState::Listening {
            return Err(HostError::InvalidState(self.state));
        }
        let listener = self
            .listener
            .take()
            .ok_or(HostError::InvalidState(self.state))?;

        let (mut health, health_service) = tonic_health::server::health_reporter();
        for group in &self.groups {
            health
                .set_service_status(*group, ServingStatus::Serving)
                .await;
        }

        let mut routes = std::mem::take(&mut self.routes);
        routes.add_service(health_service);

        let mut server = server;
        let router = server
            .layer(grpc_trace_layer())
            .add_routes(routes.routes());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let incoming = TcpListenerStream::new(listener);
        let name = self.name;

        let task = tokio::spawn(async move {
            let result = router
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = &result {
                error!(service = %name, error = %e, "RPC server error");
                fatal.trip(name, e.to_string());
            }
            result
        });

        info!(
            service = %self.name,
            address = ?self.local_addr,
            groups = ?self.groups,
            "Server listening"
        );
        self.health = Some(health);
        self.server = Some(ServerHandle { shutdown_tx, task });
        self.state = HostState::Serving;
        Ok(())
    }

    /// Stop accepting connections and terminate in-flight calls.
    ///
    /// Safe in every state; a second call is a no-op. Without a grace period
    /// the accept loop is aborted right after the shutdown signal, so open
    /// streams such as health `Watch` cannot hold the caller. With one,
    /// calls get that long to drain before they are cut off.
    pub async fn stop(&mut self, grace: Option<Duration>) -> Result<(), HostError> {
        let previous = self.state;
        self.state = HostState::Stopped;

        match previous {
            HostState::Stopped => {
                debug!(service = %self.name, "Server already stopped");
                Ok(())
            }
            HostState::Unbound | HostState::Listening => {
                self.listener.take();
                info!(service = %self.name, state = %previous, "Server stopped before serving");
                Ok(())
            }
            HostState::Serving => {
                if let Some(mut health) = self.health.take() {
                    for group in &self.groups {
                        health
                            .set_service_status(*group, ServingStatus::NotServing)
                            .await;
                    }
                }

                let Some(ServerHandle {
                    shutdown_tx,
                    mut task,
                }) = self.server.take()
                else {
                    return Ok(());
                };
                let _ = shutdown_tx.send(());

                let drained = match grace {
                    Some(limit) => tokio::time::timeout(limit, &mut task).await.ok(),
                    None => None,
                };
                let outcome = match drained {
                    Some(joined) => joined,
                    None => {
                        task.abort();
                        task.await
                    }
                };

                match outcome {
                    Ok(Ok(())) => {
                        info!(service = %self.name, "Server stopped");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(HostError::Task(e.to_string())),
                    Err(e) if e.is_cancelled() => match grace {
                        Some(limit) => {
                            warn!(service = %self.name, grace = ?limit, "Drain timed out, server aborted");
                            Err(HostError::DrainTimeout(limit))
                        }
                        None => {
                            info!(service = %self.name, "Server stopped, in-flight calls terminated");
                            Ok(())
                        }
                    },
                    Err(e) => Err(HostError::Task(e.to_string())),
                }
            }
        }
    }
}

/// Tracing layer opening one span per RPC, tagged with path and correlation id.
pub fn grpc_trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::GrpcErrorsAsFailures>,
    impl Fn(&http::Request<tonic::body::BoxBody>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_grpc().make_span_with(|request: &http::Request<tonic::body::BoxBody>| {
        let correlation_id = request
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path = request.uri().path();
        tracing::info_span!("grpc", %correlation_id, %path)
    })
}

#[cfg(test)]
mod tests;
