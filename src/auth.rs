//! Bearer-token authorization.
//!
//! The HTTP proxy checks the `Authorization` header before translating a
//! request, and the management RPC group checks the same token again from
//! call metadata, so external RPC callers and proxied calls take the same
//! path.

use std::collections::HashSet;

use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::component::AUTHORIZATION_HEADER;

/// Authorization failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    Missing,

    #[error("malformed authorization header, expected 'Bearer <token>'")]
    Malformed,

    #[error("authorization token rejected")]
    Rejected,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

/// Decides whether a bearer token grants access.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<(), AuthError>;
}

/// Static set of accepted access keys.
///
/// An empty set accepts any well-formed token.
#[derive(Debug, Clone, Default)]
pub struct AccessKeys {
    keys: HashSet<String>,
}

impl AccessKeys {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    /// True when any well-formed token is accepted.
    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TokenValidator for AccessKeys {
    fn validate(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if self.is_open() || self.keys.contains(token) {
            Ok(())
        } else {
            Err(AuthError::Rejected)
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Malformed);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Validate the bearer token carried in RPC metadata.
pub fn authorize(metadata: &MetadataMap, validator: &dyn TokenValidator) -> Result<(), AuthError> {
    let header = metadata
        .get(AUTHORIZATION_HEADER)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    validator.validate(bearer_token(header)?)
}
