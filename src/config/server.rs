//! Server configuration
//!
//! Settings come from built-in defaults, optionally overlaid by a TOML file,
//! then by command line flags.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::server::PROTOCOL_NAME;

/// Default listen port
pub const DEFAULT_PORT: u16 = 9000;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Hosts whose pages may open a chat connection
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "localhost",
    "localhost:9000",
    "goat:9000",
    "192.168.1.2:9000",
];

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the chat server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Sub-protocol clients must request first
    pub protocol: String,
    /// Origin hosts (`host` or `host:port`) allowed to connect
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            protocol: PROTOCOL_NAME.to_string(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|host| host.to_string())
                .collect(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration with the default allowlist
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    ///
    /// Keys missing from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Replace the origin allowlist
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
