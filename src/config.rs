//! # Configuration Management
//!
//! Centralized configuration for the bundle transport.
//!
//! This module provides structured configuration for servers and clients,
//! including worker-pool sizing, timeouts, compression settings, and TLS
//! material locations, plus the fixed wire constants of the bundle framing.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides
//!
//! ## Security Considerations
//! - Bundle size caps (64 MiB) bound memory per connection
//! - The unauthenticated-connection timeout (10 s) limits slowloris exposure
//! - Compression threshold avoids inflating small bundles

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Hard cap on a bundle's decompressed payload (64 MiB).
pub const MAX_BUNDLE_SIZE: usize = 64 * 1024 * 1024;

/// Hard cap on a bundle's compressed, on-wire payload (64 MiB).
pub const MAX_WIRE_BUNDLE_SIZE: usize = 64 * 1024 * 1024;

/// Magic bytes every inbound connection must present in its first bundle,
/// immediately followed by one selector byte naming the protocol to attach.
pub const CONNECTION_HEADER: [u8; 4] = [0x42, 0x4E, 0x44, 0x4C]; // "BNDL"

/// Absolute budget for the outbound connect sequence (resolve + connect + TLS).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline applied to a fresh inbound connection until it authenticates.
pub const UNAUTHENTICATED_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period a worker grants its live connections at shutdown before
/// force-cancelling them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Channel/transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::Config(format!("failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::Config(format!("failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BUNDLE_TRANSPORT_LISTEN_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(workers) = std::env::var("BUNDLE_TRANSPORT_WORKERS") {
            if let Ok(val) = workers.parse::<usize>() {
                config.server.workers = val;
            }
        }

        if let Ok(timeout) = std::env::var("BUNDLE_TRANSPORT_ACTIVITY_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.transport.activity_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("BUNDLE_TRANSPORT_COMPRESSION_LEVEL") {
            if let Ok(val) = level.parse::<i32>() {
                config.transport.compression_level = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::Config(format!("failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the configuration
    /// is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Number of connection workers (one OS thread each)
    pub workers: usize,

    /// Path to the PEM certificate chain presented to clients
    pub cert_path: Option<String>,

    /// Path to the PEM private key
    pub key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            workers: 2,
            cert_path: None,
            key_path: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "invalid server address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.workers == 0 {
            errors.push("worker count must be greater than 0".to_string());
        } else if self.workers > 256 {
            errors.push(format!(
                "worker count very high: {} (one OS thread per worker)",
                self.workers
            ));
        }

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("cert_path and key_path must be set together".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target host name (also used for TLS server-name verification)
    pub host: String,

    /// Target port
    pub port: u16,

    /// Budget for the whole connect sequence (resolve, connect, TLS)
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 9000,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("client host cannot be empty".to_string());
        }

        if self.port == 0 {
            errors.push("client port cannot be 0".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Channel/transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Compression algorithm applied to bundle payloads ("lz4" or "zstd")
    pub compression: String,

    /// Compression level (zstd: 1-22, ignored for lz4)
    pub compression_level: i32,

    /// Idle window a connection is granted after each successful bundle
    /// exchange before its deadline fires
    #[serde(with = "duration_serde")]
    pub activity_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression: String::from("zstd"),
            compression_level: 3,
            activity_timeout: Duration::from_secs(300),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.compression.as_str() {
            "lz4" | "zstd" => {}
            other => errors.push(format!(
                "unknown compression algorithm: '{other}' (expected 'lz4' or 'zstd')"
            )),
        }

        if self.compression == "zstd" && !(1..=22).contains(&self.compression_level) {
            errors.push(format!(
                "invalid compression level: {} (valid range: 1-22)",
                self.compression_level
            ));
        }

        if self.activity_timeout.as_millis() < 100 {
            errors.push("activity timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("bundle-transport"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("application name cannot be empty".to_string());
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("at least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("invalid log level: {level_str}")))
    }
}
