//! # Configuration Management
//!
//! Structured configuration for the server core and its logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! Durations are expressed in milliseconds in TOML and environment variables.
//!
//! ## Example
//! ```toml
//! [server]
//! packet_send_limit = 20
//! packet_receive_limit = 20
//! accept_timeout = 1000
//! heartbeat_interval = 60000
//! idle_timeout = 600000
//! read_chunk_size = 1024
//! shutdown_timeout = 10000
//! ```

use crate::error::{ConduitError, Result};
use crate::protocol::DEFAULT_READ_CHUNK;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Capacity of the queue carrying broker-originated packets to a connection
pub const BROKER_QUEUE_CAPACITY: usize = 64;

/// Default capacity of the application outbound and inbound queues
pub const DEFAULT_QUEUE_LIMIT: usize = 20;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConduitConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConduitConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("TCP_CONDUIT_SEND_LIMIT")? {
            config.server.packet_send_limit = val;
        }
        if let Some(val) = env_parse::<usize>("TCP_CONDUIT_RECEIVE_LIMIT")? {
            config.server.packet_receive_limit = val;
        }
        if let Some(val) = env_parse::<u64>("TCP_CONDUIT_ACCEPT_TIMEOUT_MS")? {
            config.server.accept_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("TCP_CONDUIT_HEARTBEAT_INTERVAL_MS")? {
            config.server.heartbeat_interval = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("TCP_CONDUIT_IDLE_TIMEOUT_MS")? {
            config.server.idle_timeout = Duration::from_millis(val);
        }
        if let Ok(level) = std::env::var("TCP_CONDUIT_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ConduitError::ConfigError(format!("Invalid log level: {level}")))?;
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.server.validate();
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConduitError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConduitError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capacity of each connection's application outbound queue
    pub packet_send_limit: usize,

    /// Capacity of each connection's inbound queue
    pub packet_receive_limit: usize,

    /// Bounded wait for each accept attempt
    #[serde(with = "duration_serde")]
    pub accept_timeout: Duration,

    /// Tick of the heartbeat monitor
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Idle time after which the heartbeat monitor closes a connection
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Bytes requested from the socket per read
    pub read_chunk_size: usize,

    /// Upper bound used by `Server::stop_timeout`
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            packet_send_limit: DEFAULT_QUEUE_LIMIT,
            packet_receive_limit: DEFAULT_QUEUE_LIMIT,
            accept_timeout: timeout::ACCEPT_TIMEOUT,
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            idle_timeout: timeout::IDLE_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, limit) in [
            ("Send queue limit", self.packet_send_limit),
            ("Receive queue limit", self.packet_receive_limit),
        ] {
            if limit == 0 {
                errors.push(format!("{name} must be greater than 0"));
            } else if limit > 1_000_000 {
                errors.push(format!(
                    "{name} too large: {limit} (max recommended: 1,000,000)"
                ));
            }
        }

        if self.accept_timeout.as_millis() < 10 {
            errors.push("Accept timeout too short (minimum: 10ms)".to_string());
        } else if self.accept_timeout.as_secs() > 60 {
            errors.push("Accept timeout too long (maximum: 60s)".to_string());
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.idle_timeout <= self.heartbeat_interval {
            errors.push(format!(
                "Idle timeout ({}ms) must be longer than the heartbeat interval ({}ms)",
                self.idle_timeout.as_millis(),
                self.heartbeat_interval.as_millis()
            ));
        }

        if self.read_chunk_size == 0 {
            errors.push("Read chunk size must be greater than 0".to_string());
        } else if self.read_chunk_size > 16 * 1024 * 1024 {
            errors.push("Read chunk size too large (maximum: 16 MB)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 300 {
            errors.push("Shutdown timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("tcp-conduit"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
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
                .push("At least one logging output (console or file) must be enabled".to_string());
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
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
