//! Configuration module
//!
//! The transport's settings surface: enable flag, local listen endpoint,
//! configured outgoing endpoints, and the reconnection retry delay. The
//! embedding process owns where these values come from; this module only
//! parses and validates them (with TOML load/save for convenience).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Whether the transport should run at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local listen endpoint as "IP:PORT"; empty (or the "any" endpoint
    /// 0.0.0.0:0) disables listening
    #[serde(default)]
    pub listen_endpoint: String,

    /// Remote endpoints to connect to at startup, as "HOST:PORT" strings;
    /// hostnames are resolved when the transport starts
    #[serde(default)]
    pub connect_to: Vec<String>,

    /// Seconds to wait before a reconnect attempt; 0 disables retry
    #[serde(default)]
    pub retry_delay_secs: u64,
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_endpoint: String::new(),
            connect_to: Vec::new(),
            retry_delay_secs: 0,
        }
    }
}

impl TransportConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: TransportConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations, falling back to the
    /// defaults when no file exists
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            PathBuf::from("./meshbus.toml"),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The parsed listen address; `None` disables listening
    pub fn listen_addr(&self) -> ConfigResult<Option<SocketAddr>> {
        let raw = self.listen_endpoint.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let addr: SocketAddr = raw
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(raw.to_string()))?;

        // The distinguished "any" endpoint also disables listening
        if addr.ip().is_unspecified() && addr.port() == 0 {
            return Ok(None);
        }
        Ok(Some(addr))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> String {
    let config = TransportConfig {
        enabled: true,
        listen_endpoint: format!("0.0.0.0:{}", DEFAULT_PORT),
        connect_to: vec![format!("192.168.1.20:{}", DEFAULT_PORT)],
        retry_delay_secs: 5,
    };

    toml::to_string_pretty(&config).unwrap_or_default()
}
