//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WSMUX_CONFIG or `--config`)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Minimum outbound queue capacity.
pub const MIN_OUTBOUND_QUEUE: usize = 16;

/// Maximum outbound queue capacity.
pub const MAX_OUTBOUND_QUEUE: usize = 64 * 1024;

/// Default number of undelivered messages buffered per tunnel.
pub const DEFAULT_TUNNEL_BUFFER: usize = 64;

/// Maximum per-tunnel buffer.
pub const MAX_TUNNEL_BUFFER: usize = 4096;

/// Default capacity of the connection event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the multiplexing server. Capabilities are fetched from
    /// this URL and the WebSocket is opened against it.
    pub server: String,
    /// Timeout for negotiation and the WebSocket handshake, in seconds.
    pub connect_timeout_secs: u64,
    /// Capacity of the outbound frame queue.
    pub outbound_queue: usize,
    /// Undelivered messages buffered per tunnel. A tunnel whose reader
    /// falls further behind is closed.
    pub tunnel_buffer: usize,
    /// Capacity of the connection event broadcast channel.
    pub event_capacity: usize,
    /// User agent sent with the negotiation request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080/".to_string(),
            connect_timeout_secs: 10,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            tunnel_buffer: DEFAULT_TUNNEL_BUFFER,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            user_agent: concat!("wsmux/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_outbound_queue(mut self, size: usize) -> Self {
        self.outbound_queue = size.clamp(MIN_OUTBOUND_QUEUE, MAX_OUTBOUND_QUEUE);
        self
    }

    pub fn with_tunnel_buffer(mut self, size: usize) -> Self {
        self.tunnel_buffer = size.clamp(1, MAX_TUNNEL_BUFFER);
        self
    }

    pub fn with_event_capacity(mut self, size: usize) -> Self {
        self.event_capacity = size.max(1);
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WSMUX_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(server) = std::env::var("WSMUX_SERVER") {
            self.server = server;
        }

        if let Ok(timeout) = std::env::var("WSMUX_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }

        if let Ok(size) = std::env::var("WSMUX_OUTBOUND_QUEUE") {
            if let Ok(n) = size.parse() {
                self.outbound_queue = n;
            }
        }

        if let Ok(size) = std::env::var("WSMUX_TUNNEL_BUFFER") {
            if let Ok(n) = size.parse() {
                self.tunnel_buffer = n;
            }
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_url()?;

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if !(MIN_OUTBOUND_QUEUE..=MAX_OUTBOUND_QUEUE).contains(&self.outbound_queue) {
            return Err(ConfigError::Invalid(format!(
                "outbound_queue must be between {} and {}",
                MIN_OUTBOUND_QUEUE, MAX_OUTBOUND_QUEUE
            )));
        }
        if self.tunnel_buffer == 0 || self.tunnel_buffer > MAX_TUNNEL_BUFFER {
            return Err(ConfigError::Invalid(format!(
                "tunnel_buffer must be between 1 and {}",
                MAX_TUNNEL_BUFFER
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Parses the server base URL.
    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.server)
            .map_err(|e| ConfigError::Invalid(format!("server URL {:?}: {}", self.server, e)))?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ConfigError::Invalid(format!(
                "unsupported server URL scheme {:?}",
                other
            ))),
        }
    }

    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
