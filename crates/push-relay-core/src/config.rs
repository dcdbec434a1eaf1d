//! Backend and relay configuration.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Messaging backend configuration supplied with a start command.
///
/// Only the sender identity is interpreted by the session manager; every
/// other option (api key, app id, project id...) is passed through to the
/// messaging client untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend sender identity the registration is bound to.
    #[serde(rename = "senderId")]
    pub sender_id: String,

    /// Arbitrary backend options.
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

impl BackendConfig {
    /// Create a config with just a sender identity.
    #[must_use]
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            options: HashMap::new(),
        }
    }

    /// Create a config with backend options.
    #[must_use]
    pub fn with_options(sender_id: impl Into<String>, options: HashMap<String, Value>) -> Self {
        Self {
            sender_id: sender_id.into(),
            options,
        }
    }

    /// Get a backend option by key.
    #[must_use]
    pub fn get_option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// Set a backend option.
    pub fn set_option(&mut self, key: impl Into<String>, value: Value) {
        self.options.insert(key.into(), value);
    }
}

/// Environment variable overriding [`RelayConfig::store_path`].
pub const STORE_PATH_ENV: &str = "PUSH_RELAY_STORE";

/// Environment variable overriding [`RelayConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "PUSH_RELAY_ADDR";

const STORE_FILE_NAME: &str = "store.json";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid bind address {value:?}: {source}")]
    InvalidAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Host-side relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path of the durable key-value store file.
    pub store_path: PathBuf,
    /// Address the presentation transport listens on.
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

impl RelayConfig {
    /// Build the default config, overridden by `PUSH_RELAY_STORE` and
    /// `PUSH_RELAY_ADDR` when set.
    ///
    /// # Errors
    /// Returns error if `PUSH_RELAY_ADDR` is not a socket address.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = lookup(STORE_PATH_ENV).filter(|p| !p.is_empty()) {
            config.store_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup(BIND_ADDR_ENV).filter(|a| !a.is_empty()) {
            config.bind_addr = addr
                .parse()
                .map_err(|source| ConfigError::InvalidAddr { value: addr, source })?;
        }
        Ok(config)
    }
}

/// Default location of the store file under the platform data directory.
#[must_use]
pub fn default_store_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("push-relay-store.json"),
        |dir| dir.join("push-relay").join(STORE_FILE_NAME),
    )
}
