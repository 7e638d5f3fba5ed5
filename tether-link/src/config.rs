//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TETHER_CONFIG or --config)
//! 3. Environment variables

use crate::link::{HandshakeFailurePolicy, LinkConfig};
use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_protocol::varint::MAX_VARINT_VALUE;
use tether_transform::ChaChaTransform;
use thiserror::Error;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Link behaviour.
    pub link: LinkSettings,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TETHER_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.link.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "network.read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be greater than zero".to_string(),
            ));
        }
        self.link.validate()
    }

    /// Builds the runtime link configuration.
    pub fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::new(self.link.name.as_str())
            .with_handshake_failure(self.link.handshake_failure)
            .with_max_payload_size(self.link.max_payload_size)
            .with_read_buffer_size(self.network.read_buffer_size)
            .with_setup_timeout(Duration::from_millis(self.link.setup_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.network.connect_timeout_ms))
            .with_reconnect_interval(Duration::from_millis(self.link.reconnect_interval_ms));
        if self.link.recovery_enabled {
            config = config.with_recovery(self.link.recovery_timeout());
        }
        if self.link.transform == TransformKind::Chacha20 {
            config = config.with_transform(ChaChaTransform::new());
        }
        config
    }

    /// Builds the server endpoint configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.network.bind_addr).with_max_connections(self.network.max_connections)
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to (server) or connect to (client).
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Bytes reserved per socket read.
    pub read_buffer_size: usize,
    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7600)),
            max_connections: 1000,
            read_buffer_size: 64 * 1024,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TETHER_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(max) = std::env::var("TETHER_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(size) = std::env::var("TETHER_READ_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }
        if let Ok(timeout) = std::env::var("TETHER_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }
    }
}

/// Which buffer transform sessions negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    None,
    /// X25519 key agreement with ChaCha20-Poly1305 sealing.
    Chacha20,
}

/// Link behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Name reported with lifecycle notifications.
    pub name: String,
    pub recovery_enabled: bool,
    /// Recovery window in milliseconds.
    pub recovery_timeout_ms: u64,
    pub transform: TransformKind,
    pub handshake_failure: HandshakeFailurePolicy,
    /// Largest accepted payload in bytes.
    pub max_payload_size: u32,
    /// Handshake plus identity exchange limit in milliseconds.
    pub setup_timeout_ms: u64,
    /// Delay between client reconnect attempts in milliseconds.
    pub reconnect_interval_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            recovery_enabled: false,
            recovery_timeout_ms: 30_000,
            transform: TransformKind::None,
            handshake_failure: HandshakeFailurePolicy::Close,
            max_payload_size: tether_protocol::DEFAULT_MAX_PAYLOAD_SIZE,
            setup_timeout_ms: 10_000,
            reconnect_interval_ms: 500,
        }
    }
}

impl LinkSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("TETHER_LINK_NAME") {
            self.name = name;
        }
        if let Ok(enabled) = std::env::var("TETHER_RECOVERY_ENABLED") {
            self.recovery_enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(timeout) = std::env::var("TETHER_RECOVERY_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.recovery_timeout_ms = ms;
            }
        }
        if let Ok(transform) = std::env::var("TETHER_TRANSFORM") {
            self.transform = match transform.to_lowercase().as_str() {
                "chacha20" | "chacha" => TransformKind::Chacha20,
                _ => TransformKind::None,
            };
        }
        if let Ok(policy) = std::env::var("TETHER_HANDSHAKE_FAILURE") {
            self.handshake_failure = match policy.to_lowercase().as_str() {
                "plaintext" => HandshakeFailurePolicy::Plaintext,
                _ => HandshakeFailurePolicy::Close,
            };
        }
        if let Ok(size) = std::env::var("TETHER_MAX_PAYLOAD_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_payload_size = n;
            }
        }
        if let Ok(timeout) = std::env::var("TETHER_SETUP_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.setup_timeout_ms = ms;
            }
        }
        if let Ok(interval) = std::env::var("TETHER_RECONNECT_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.reconnect_interval_ms = ms;
            }
        }
    }

    /// Returns the recovery window as Duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery_enabled && self.recovery_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "recovery enabled but recovery_timeout_ms is zero".to_string(),
            ));
        }
        if self.max_payload_size == 0 || self.max_payload_size > MAX_VARINT_VALUE {
            return Err(ConfigError::Validation(format!(
                "max_payload_size must be between 1 and {}",
                MAX_VARINT_VALUE
            )));
        }
        if self.setup_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "setup_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TETHER_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("TETHER_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
