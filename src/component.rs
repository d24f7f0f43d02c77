//! Process identity.
//!
//! A [`Component`] carries this process's role, its announced endpoint and
//! the credential attached to outbound calls. It is created once at startup,
//! shared read-only by the RPC host and the HTTP proxy, and lives as long as
//! the process.

use std::time::Duration;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Status};
use tracing::info;

use crate::config::IdentityConfig;

/// Metadata key carrying the caller's component id.
pub const COMPONENT_ID_HEADER: &str = "x-component-id";
/// Metadata key carrying the caller's component role.
pub const COMPONENT_ROLE_HEADER: &str = "x-component-role";
/// Metadata key carrying bearer credentials.
pub const AUTHORIZATION_HEADER: &str = "authorization";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Errors creating or using the process identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid announce address '{address}': {reason}")]
    InvalidAnnounce { address: String, reason: String },

    #[error("invalid component {field}: not a valid metadata value")]
    InvalidMetadata { field: &'static str },

    #[error("could not open channel to {address}: {reason}")]
    Dial { address: String, reason: String },
}

/// This process's identity.
#[derive(Debug)]
pub struct Component {
    id: String,
    role: String,
    announce: String,
    token: Option<String>,
    max_message_size: usize,
}

impl Component {
    /// Create the identity for `role`, announced at `announce` (`host:port`).
    pub fn new(role: &str, announce: &str, config: &IdentityConfig) -> Result<Self, IdentityError> {
        validate_announce(announce)?;

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", role, uuid::Uuid::new_v4()));
        ascii_value(&id, "id")?;
        ascii_value(role, "role")?;
        if let Some(token) = &config.token {
            ascii_value(&format!("Bearer {}", token), "token")?;
        }

        info!(id = %id, role = %role, announce = %announce, "Component identity created");

        Ok(Self {
            id,
            role: role.to_string(),
            announce: announce.to_string(),
            token: config.token.clone(),
            max_message_size: config.max_message_size,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Externally announced `host:port`.
    pub fn announce_address(&self) -> &str {
        &self.announce
    }

    /// Maximum encoded/decoded RPC message size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Server builder carrying this component's transport options.
    pub fn server_builder(&self) -> Server {
        Server::builder()
            .tcp_nodelay(true)
            .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
    }

    /// Interceptor attaching this component's metadata to outbound calls.
    pub fn interceptor(&self) -> ComponentInterceptor {
        // Values were validated in `new`.
        ComponentInterceptor {
            id: MetadataValue::try_from(self.id.as_str()).ok(),
            role: MetadataValue::try_from(self.role.as_str()).ok(),
            token: self
                .token
                .as_ref()
                .and_then(|t| MetadataValue::try_from(format!("Bearer {}", t)).ok()),
        }
    }

    /// Open an RPC channel back to this process's announced address.
    ///
    /// The channel connects lazily on first use, so dialing does not depend
    /// on the accept loop having started.
    pub fn dial(&self) -> Result<Channel, IdentityError> {
        let uri = format!("http://{}", self.announce);
        let endpoint = Endpoint::from_shared(uri).map_err(|e| IdentityError::Dial {
            address: self.announce.clone(),
            reason: e.to_string(),
        })?;
        Ok(endpoint
            .tcp_nodelay(true)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .connect_lazy())
    }
}

/// Adds `x-component-id`, `x-component-role` and, when configured, the
/// component token to every outbound request. An `authorization` entry set
/// by the caller is left untouched.
#[derive(Clone)]
pub struct ComponentInterceptor {
    id: Option<MetadataValue<Ascii>>,
    role: Option<MetadataValue<Ascii>>,
    token: Option<MetadataValue<Ascii>>,
}

impl Interceptor for ComponentInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let metadata = request.metadata_mut();
        if let Some(id) = &self.id {
            metadata.insert(COMPONENT_ID_HEADER, id.clone());
        }
        if let Some(role) = &self.role {
            metadata.insert(COMPONENT_ROLE_HEADER, role.clone());
        }
        if let Some(token) = &self.token {
            if !metadata.contains_key(AUTHORIZATION_HEADER) {
                metadata.insert(AUTHORIZATION_HEADER, token.clone());
            }
        }
        Ok(request)
    }
}

fn validate_announce(announce: &str) -> Result<(), IdentityError> {
    let invalid = |reason: &str| IdentityError::InvalidAnnounce {
        address: announce.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = announce
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(invalid("port must be in 1..=65535")),
        Ok(_) => {}
    }
    format!("http://{}", announce)
        .parse::<http::Uri>()
        .map_err(|e| invalid(&e.to_string()))?;
    Ok(())
}

fn ascii_value(value: &str, field: &'static str) -> Result<(), IdentityError> {
    MetadataValue::<Ascii>::try_from(value)
        .map(|_| ())
        .map_err(|_| IdentityError::InvalidMetadata { field })
}
