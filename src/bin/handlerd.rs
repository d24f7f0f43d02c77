//! handlerd: application handler service
//!
//! Hosts the handler's RPC groups, optionally fronted by an HTTP proxy, backed
//! by Redis and optionally attached to NATS and AMQP brokers.
//!
//! ## Architecture
//! ```text
//! [upstream broker] --gRPC--> [handlerd] --publish--> [NATS / AMQP]
//!                                 ^  |
//!        [REST client] --HTTP--> proxy  +--> [Redis]
//! ```
//!
//! ## Configuration
//! - `--config <path>`: YAML configuration file
//! - HANDLERD_CONFIG: YAML configuration file
//! - HANDLERD__<SECTION>__<KEY>: individual overrides (e.g. HANDLERD__HTTP__PORT)
//! - HANDLERD_LOG: log filter (default: info)

use tracing::{error, info};

use handlerd::config::Config;
use handlerd::lifecycle::shutdown_signal;
use handlerd::process::{LiveDependencies, Orchestrator};
use handlerd::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path(std::env::args());
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting handlerd");

    let orchestrator = Orchestrator::new(config, LiveDependencies);
    let report = orchestrator.run(shutdown_signal()).await.map_err(|e| {
        error!(error = %e, "handlerd exited with error");
        e
    })?;

    if !report.is_clean() {
        for (step, e) in &report.errors {
            error!(step = %step, error = %e, "Release failed");
        }
    }
    info!("handlerd stopped");
    Ok(())
}
