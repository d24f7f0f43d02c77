//! Store configuration types.

use serde::Deserialize;
use url::Url;

/// Key-value store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store host and port (e.g., "localhost:6379").
    pub address: String,
    /// Logical database (partition) index.
    pub db: i64,
    /// Password; empty means no authentication.
    pub password: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_string(),
            db: 0,
            password: String::new(),
        }
    }
}

impl StoreConfig {
    fn has_scheme(&self) -> bool {
        self.address.starts_with("redis://") || self.address.starts_with("rediss://")
    }

    /// Connection URL for the Redis client.
    ///
    /// The password is percent-encoded into the userinfo; a password already
    /// present in a full `redis://` address wins over `password`.
    pub fn url(&self) -> String {
        let base = if self.has_scheme() {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("redis://{}", self.address)
        };

        match Url::parse(&base) {
            Ok(mut url) => {
                if !self.password.is_empty() && url.password().is_none() {
                    // Only fails for URLs without a host, which Redis rejects anyway.
                    let _ = url.set_password(Some(&self.password));
                }
                url.set_path(&format!("/{}", self.db));
                url.to_string()
            }
            // Left for the Redis client to reject with its own error.
            Err(_) => format!("{}/{}", base, self.db),
        }
    }

    /// Coordinates safe for logging (`address/db`), without userinfo.
    pub fn display_target(&self) -> String {
        let (scheme, rest) = match self.address.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, self.address.as_str()),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let host = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host);

        match scheme {
            Some(scheme) => format!("{}://{}/{}", scheme, host, self.db),
            None => format!("{}/{}", host, self.db),
        }
    }
}
