//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables. The
//! resolved value is immutable once orchestration begins.

mod messaging;
mod server;
mod storage;

pub use messaging::{broker_specs, PubSubConfig, QueueConfig, UpstreamConfig};
pub use server::{HttpConfig, IdentityConfig, ServerConfig, ShutdownConfig};
pub use storage::StoreConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "handlerd.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HANDLERD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HANDLERD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HANDLERD_LOG";

use serde::Deserialize;

use crate::bus::BrokerSpec;
use crate::error::Error;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RPC server configuration.
    pub server: ServerConfig,
    /// HTTP proxy configuration.
    pub http: HttpConfig,
    /// Key-value store configuration.
    pub store: StoreConfig,
    /// Upstream peer configuration.
    pub upstream: UpstreamConfig,
    /// Primary (pub/sub) broker.
    pub pubsub: PubSubConfig,
    /// Secondary (queue) broker.
    pub queue: QueueConfig,
    /// Component identity.
    pub identity: IdentityConfig,
    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `handlerd.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Check that every listener address is fully resolved and every enabled
    /// broker can be attached by this build.
    ///
    /// A disabled HTTP proxy (empty address or zero port) is not an error.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server.address.is_empty() {
            return Err(Error::ConfigInvalid("server.address is empty".into()));
        }
        if self.server.port == 0 {
            return Err(Error::ConfigInvalid("server.port must be non-zero".into()));
        }
        if self.server.address_announce.is_empty() {
            return Err(Error::ConfigInvalid(
                "server.address_announce is empty".into(),
            ));
        }
        if self.store.address.is_empty() {
            return Err(Error::ConfigInvalid("store.address is empty".into()));
        }
        if self.store.db < 0 {
            return Err(Error::ConfigInvalid("store.db must not be negative".into()));
        }
        if self.identity.max_message_size == 0 {
            return Err(Error::ConfigInvalid(
                "identity.max_message_size must be non-zero".into(),
            ));
        }
        if self.pubsub.is_enabled() && !cfg!(feature = "nats") {
            return Err(Error::ConfigInvalid(
                "pubsub.target is set but NATS support is not compiled in".into(),
            ));
        }
        if self.queue.is_enabled() {
            if !cfg!(feature = "amqp") {
                return Err(Error::ConfigInvalid(
                    "queue.target is set but AMQP support is not compiled in".into(),
                ));
            }
            if self.queue.exchange.is_empty() {
                return Err(Error::ConfigInvalid(
                    "queue.exchange is empty while the queue broker is enabled".into(),
                ));
            }
        }
        Ok(())
    }

    /// Attachment specs for every enabled broker.
    pub fn broker_specs(&self) -> Vec<BrokerSpec> {
        broker_specs(&self.pubsub, &self.queue)
    }

    /// Create config for testing: loopback listeners on the given RPC port.
    pub fn for_test(rpc_port: u16) -> Self {
        let mut config = Self::default();
        config.server.address = "127.0.0.1".to_string();
        config.server.address_announce = "127.0.0.1".to_string();
        config.server.port = rpc_port;
        config
    }
}
