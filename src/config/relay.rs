//! Relay configuration
//!
//! Loads the relay settings from a TOML file. Every section is optional and
//! falls back to defaults; command line flags are applied on top by `main`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{Algorithm, ExpiryPolicy, TokenVerifier};

/// Default listen address
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;
/// Default per-member send timeout in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
/// Default outbound queue length per member
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenSection {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Token verification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Shared secret the account service signs tokens with
    #[serde(default)]
    pub secret: String,
    /// Expected signing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Reject tokens whose `exp` has passed
    #[serde(default = "default_true")]
    pub validate_exp: bool,
    /// Reject tokens without `exp`
    #[serde(default)]
    pub require_exp: bool,
    /// Allowed clock skew in seconds
    #[serde(default)]
    pub leeway_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: Algorithm::default(),
            validate_exp: true,
            require_exp: false,
            leeway_secs: 0,
        }
    }
}

/// Fanout settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// How long one delivery may wait on a full member queue
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Outbound queue length per member
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Whether a sender receives its own chat messages
    #[serde(default = "default_true")]
    pub echo_to_sender: bool,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
            echo_to_sender: true,
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ListenSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub relay: RelaySection,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Check values that cannot be expressed in the types
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.secret must be set (config file, --secret or RELAY_SECRET)".to_string(),
            ));
        }
        if self.relay.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "relay.outbound_buffer must be at least 1".to_string(),
            ));
        }
        if self.relay.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.send_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the token verifier described by the `auth` section
    pub fn token_verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.auth.secret.as_bytes(), self.auth.algorithm).with_policy(
            ExpiryPolicy {
                validate_exp: self.auth.validate_exp,
                require_exp: self.auth.require_exp,
                leeway_secs: self.auth.leeway_secs,
            },
        )
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.send_timeout_ms)
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}
