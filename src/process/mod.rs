//! Process orchestration.
//!
//! Brings the handler process up in dependency order, waits for a
//! termination signal, then releases everything in reverse.
//!
//! ```text
//! validate -> store -> identity -> handler.init -> rpc bind/register/serve -> [http proxy]
//!                                                                                 |
//!                                                                    signal or fatal trip
//!                                                                                 v
//!                              store <- handler.shutdown <- rpc stop <- proxy cancel
//! ```
//!
//! Every acquisition pushes its release onto a [`Teardown`] stack right away,
//! so a failing step unwinds exactly what came before it.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::auth::AccessKeys;
use crate::bus::{self, BrokerAttachment, BrokerSpec, BusError};
use crate::component::Component;
use crate::config::{Config, StoreConfig};
use crate::error::{Error, ReleaseError, Result};
use crate::handler::Handler;
use crate::lifecycle::{FatalSignal, ShutdownReport, Teardown};
use crate::proxy::{self, EdgeProxy};
use crate::storage::{self, KvStore, StoreError};
use crate::test_utils::Journal;
use crate::transport::ServiceHost;

/// Role announced by this process.
pub const ROLE: &str = "handler";

/// Listener name of the RPC server.
pub const RPC_LISTENER: &str = "rpc";

/// Release step labels.
pub mod steps {
    pub const STORE: &str = "store";
    pub const HANDLER: &str = "handler";
    pub const RPC_SERVER: &str = "rpc-server";
    pub const EDGE_PROXY: &str = "edge-proxy";
}

/// External resources the orchestrator acquires.
#[async_trait]
pub trait Dependencies: Send + Sync {
    /// Connect to the store and verify it answers.
    async fn connect_store(
        &self,
        config: &StoreConfig,
    ) -> std::result::Result<Arc<dyn KvStore>, StoreError>;

    /// Build, without connecting, the attachment described by `spec`.
    fn attachment(
        &self,
        spec: &BrokerSpec,
    ) -> std::result::Result<Arc<dyn BrokerAttachment>, BusError>;

    /// Journal that listener release steps record into once they complete.
    fn journal(&self) -> Option<Journal> {
        None
    }
}

/// Redis store and real broker clients.
pub struct LiveDependencies;

#[async_trait]
impl Dependencies for LiveDependencies {
    async fn connect_store(
        &self,
        config: &StoreConfig,
    ) -> std::result::Result<Arc<dyn KvStore>, StoreError> {
        storage::connect_store(config).await
    }

    fn attachment(
        &self,
        spec: &BrokerSpec,
    ) -> std::result::Result<Arc<dyn BrokerAttachment>, BusError> {
        bus::attachment_for(spec)
    }
}

/// Orchestrator phase, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    ResourcesAcquired,
    ServicesRunning,
    AwaitingSignal,
    ShuttingDown,
    Exited,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::ResourcesAcquired => "resources-acquired",
            Phase::ServicesRunning => "services-running",
            Phase::AwaitingSignal => "awaiting-signal",
            Phase::ShuttingDown => "shutting-down",
            Phase::Exited => "exited",
        };
        f.write_str(name)
    }
}

fn enter(phase: Phase) {
    info!(phase = %phase, "Orchestrator phase");
}

/// Top-level driver of the handler process.
pub struct Orchestrator<D> {
    config: Config,
    deps: D,
}

impl<D: Dependencies> Orchestrator<D> {
    pub fn new(config: Config, deps: D) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Acquire every resource and start the listeners.
    ///
    /// If a step fails, everything acquired before it is released before the
    /// error is returned.
    pub async fn start(&self) -> Result<Running> {
        enter(Phase::Start);
        let mut teardown = Teardown::new();
        let fatal = FatalSignal::new();

        match self.acquire(&mut teardown, &fatal).await {
            Ok((handler, rpc_addr, http_addr)) => {
                enter(Phase::ServicesRunning);
                Ok(Running {
                    rpc_addr,
                    http_addr,
                    handler,
                    teardown,
                    fatal,
                })
            }
            Err(e) => {
                error!(error = %e, "Startup failed");
                let report = teardown.unwind().await;
                if !report.steps.is_empty() {
                    info!(
                        steps = ?report.steps,
                        failures = report.errors.len(),
                        "Released partially started resources"
                    );
                }
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        teardown: &mut Teardown,
        fatal: &FatalSignal,
    ) -> Result<(Arc<Handler>, SocketAddr, Option<SocketAddr>)> {
        let config = &self.config;
        config.validate()?;
        log_endpoints(config);

        let store = self
            .deps
            .connect_store(&config.store)
            .await
            .map_err(Error::StoreUnavailable)?;
        {
            let store = store.clone();
            teardown.push(steps::STORE, move || async move {
                store.close().await.err().map(ReleaseError::Store).into_iter().collect()
            });
        }

        let component = Arc::new(
            Component::new(ROLE, &config.server.announce_addr(), &config.identity)
                .map_err(Error::IdentityInitFailed)?,
        );

        let validator = Arc::new(AccessKeys::new(config.http.access_keys.clone()));
        if proxy::is_enabled(&config.http) && validator.is_open() {
            warn!("http.access_keys is empty, any well-formed bearer token is accepted");
        }

        let mut handler = Handler::new(store, config.upstream.broker_id.clone())
            .with_token_validator(validator.clone());
        for spec in config.broker_specs() {
            let attachment = self.deps.attachment(&spec).map_err(|e| {
                Error::ConfigInvalid(format!("{} broker at {}: {}", spec.kind, spec.target, e))
            })?;
            handler = handler.with_broker(attachment);
        }
        handler
            .init(component.clone())
            .await
            .map_err(Error::HandlerInitFailed)?;
        let handler = Arc::new(handler);
        {
            let handler = handler.clone();
            teardown.push(steps::HANDLER, move || async move { handler.shutdown().await });
        }
        enter(Phase::ResourcesAcquired);

        let grace = config.shutdown.grace_period();
        let journal = self.deps.journal();
        let host = Arc::new(Mutex::new(ServiceHost::new(RPC_LISTENER)));
        let rpc_addr = host
            .lock()
            .await
            .bind(&config.server.listen_addr())
            .await
            .map_err(|source| Error::ListenFailed {
                listener: RPC_LISTENER,
                source,
            })?;
        {
            let host = host.clone();
            let journal = journal.clone();
            teardown.push(steps::RPC_SERVER, move || async move {
                let result = host.lock().await.stop(grace).await;
                if let Some(journal) = journal {
                    journal.record("rpc-server.stop");
                }
                result.err().map(ReleaseError::Server).into_iter().collect()
            });
        }

        {
            let mut host = host.lock().await;
            handler
                .register_rpc(&mut host)
                .map_err(Error::HandlerInitFailed)?;
            handler
                .register_manager(&mut host)
                .map_err(Error::HandlerInitFailed)?;
            host.serve(component.server_builder(), fatal.clone())
                .await
                .map_err(|source| Error::ListenFailed {
                    listener: RPC_LISTENER,
                    source,
                })?;
        }
        handler.begin_serving().map_err(Error::HandlerInitFailed)?;

        let http_addr = if proxy::is_enabled(&config.http) {
            let proxy =
                EdgeProxy::start(&config.http, &component, validator, fatal.clone()).await?;
            let addr = proxy.local_addr();
            teardown.push(steps::EDGE_PROXY, move || async move {
                let mut proxy = proxy;
                let result = proxy.stop(grace).await;
                if let Some(journal) = journal {
                    if proxy.context().is_cancelled() {
                        journal.record("edge-proxy.cancel");
                    }
                }
                result.err().map(ReleaseError::Proxy).into_iter().collect()
            });
            Some(addr)
        } else {
            info!("HTTP proxy disabled");
            None
        };

        Ok((handler, rpc_addr, http_addr))
    }

    /// Start, wait for `signal` or a listener failure, then shut down.
    ///
    /// A listener that failed while serving is reported as `ServeFailed`
    /// after the full unwind.
    pub async fn run<F>(&self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        let fatal = running.fatal().clone();

        enter(Phase::AwaitingSignal);
        tokio::select! {
            _ = signal => {}
            _ = fatal.tripped() => warn!("Listener failed, shutting down"),
        }

        let report = running.shutdown().await;
        enter(Phase::Exited);

        match fatal.reason() {
            Some((listener, message)) => Err(Error::ServeFailed { listener, message }),
            None => Ok(report),
        }
    }
}

/// A fully started process.
pub struct Running {
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    handler: Arc<Handler>,
    teardown: Teardown,
    fatal: FatalSignal,
}

impl Running {
    /// Bound RPC address.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound HTTP proxy address, when the proxy is enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn fatal(&self) -> &FatalSignal {
        &self.fatal
    }

    /// Pending release steps, in acquisition order.
    pub fn pending_steps(&self) -> Vec<&'static str> {
        self.teardown.labels()
    }

    /// Release everything in reverse acquisition order.
    pub async fn shutdown(mut self) -> ShutdownReport {
        enter(Phase::ShuttingDown);
        let report = self.teardown.unwind().await;
        if report.is_clean() {
            info!(steps = ?report.steps, "Shutdown complete");
        } else {
            warn!(
                steps = ?report.steps,
                failures = report.errors.len(),
                "Shutdown complete with release failures"
            );
        }
        report
    }
}

fn log_endpoints(config: &Config) {
    let http = if proxy::is_enabled(&config.http) {
        config.http.listen_addr()
    } else {
        "disabled".to_string()
    };
    let target_or_disabled = |target: &str| {
        if target.is_empty() {
            "disabled".to_string()
        } else {
            target.to_string()
        }
    };

    info!(
        rpc = %config.server.listen_addr(),
        announce = %config.server.announce_addr(),
        http = %http,
        store = %config.store.display_target(),
        upstream = %config.upstream.broker_id,
        pubsub = %target_or_disabled(&config.pubsub.target),
        queue = %target_or_disabled(&config.queue.target),
        "Initializing handler"
    );
}
