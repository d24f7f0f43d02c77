//! Server and networking configuration types.

use std::time::Duration;

use serde::Deserialize;

/// RPC server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub address: String,
    /// Publicly announced host.
    pub address_announce: String,
    /// Port to bind to and announce.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            address_announce: "localhost".to_string(),
            port: 1904,
        }
    }
}

impl ServerConfig {
    /// Listen address (`address:port`).
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Announced address (`address_announce:port`).
    pub fn announce_addr(&self) -> String {
        format!("{}:{}", self.address_announce, self.port)
    }
}

/// HTTP proxy configuration.
///
/// The proxy is enabled only when both `address` and a non-zero `port` are set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Host to bind to.
    pub address: String,
    /// Port to bind to; 0 disables the proxy.
    pub port: u16,
    /// Accepted bearer tokens. Empty accepts any well-formed token.
    pub access_keys: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 0,
            access_keys: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn is_enabled(&self) -> bool {
        !self.address.is_empty() && self.port != 0
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Component identity configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Component id; generated when absent.
    pub id: Option<String>,
    /// Credential attached to outbound RPC calls.
    pub token: Option<String>,
    /// Maximum encoded/decoded RPC message size in bytes.
    pub max_message_size: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            token: None,
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight calls may drain on stop. When absent they are
    /// terminated as soon as the listener closes.
    pub grace_period_secs: Option<u64>,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period_secs.map(Duration::from_secs)
    }
}
