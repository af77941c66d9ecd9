//! # Configuration Management
//!
//! Centralized configuration for bus connections.
//!
//! This module provides structured configuration for how a [`MessageBus`]
//! finds its broker, authenticates, bounds message sizes and waits for replies,
//! plus the logging setup used by [`init_logging`].
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `DBUS_WIRE_*` environment overrides via `from_env()`
//!
//! ## Address Precedence
//! An explicit `connection.address` wins over the bus-type environment
//! variables, which win over the platform defaults.
//!
//! [`MessageBus`]: crate::service::bus::MessageBus
//! [`init_logging`]: crate::utils::logging::init_logging

use crate::error::{DbusError, Result};
use crate::transport::address::parse_address;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Wire protocol version byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest message the protocol allows (128 MiB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Whether fd passing is requested by default
pub const NEGOTIATE_UNIX_FD: bool = true;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BusConfig {
    /// Broker selection, limits and timeouts
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BusConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| DbusError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| DbusError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| DbusError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DBUS_WIRE_ADDRESS") {
            config.connection.address = Some(addr);
        }

        if let Ok(bus_type) = std::env::var("DBUS_WIRE_BUS_TYPE") {
            config.connection.bus_type = match bus_type.to_ascii_lowercase().as_str() {
                "session" => BusType::Session,
                "system" => BusType::System,
                other => {
                    return Err(DbusError::ConfigError(format!(
                        "Invalid DBUS_WIRE_BUS_TYPE: '{other}' (expected 'session' or 'system')"
                    )));
                }
            };
        }

        if let Ok(timeout) = std::env::var("DBUS_WIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(flag) = std::env::var("DBUS_WIRE_NEGOTIATE_UNIX_FD") {
            if let Ok(val) = flag.parse::<bool>() {
                config.auth.negotiate_unix_fd = val;
            }
        }

        if let Ok(level) = std::env::var("DBUS_WIRE_LOG_LEVEL") {
            if let Ok(val) = level.parse::<Level>() {
                config.logging.log_level = val;
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DbusError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| DbusError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.connection.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DbusError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Which well-known bus to use when no explicit address is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    #[default]
    Session,
    System,
}

/// Connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Bus used when `address` is unset
    pub bus_type: BusType,

    /// Explicit address (e.g. "unix:path=/run/user/1000/bus")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Timeout for establishing the socket connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for the Hello exchange after authentication
    #[serde(with = "duration_serde")]
    pub hello_timeout: Duration,

    /// Default timeout applied to proxy calls (none waits indefinitely)
    #[serde(default, with = "option_duration_serde", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,

    /// Largest frame accepted from the broker, in bytes
    pub max_message_size: usize,

    /// Number of queued outgoing messages after which a warning is logged
    pub command_queue_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::Session,
            address: None,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            hello_timeout: timeout::DEFAULT_TIMEOUT,
            call_timeout: None,
            max_message_size: MAX_MESSAGE_SIZE,
            command_queue_limit: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(ref address) = self.address {
            if address.is_empty() {
                errors.push("Bus address cannot be empty when set".to_string());
            } else if let Err(e) = parse_address(address) {
                errors.push(format!("Invalid bus address '{address}': {e}"));
            }
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.hello_timeout.as_millis() < 100 {
            errors.push("Hello timeout too short (minimum: 100ms)".to_string());
        } else if self.hello_timeout.as_secs() > 300 {
            errors.push("Hello timeout too long (maximum: 300s)".to_string());
        }

        if let Some(call_timeout) = self.call_timeout {
            if call_timeout.as_millis() < 10 {
                errors.push("Call timeout too short (minimum: 10ms)".to_string());
            }
        }

        if self.max_message_size < 1024 {
            errors.push("Max message size too small (minimum: 1 KB)".to_string());
        } else if self.max_message_size > MAX_MESSAGE_SIZE {
            errors.push(format!(
                "Max message size too large: {} bytes (protocol maximum: 128 MiB)",
                self.max_message_size
            ));
        }

        if self.command_queue_limit == 0 {
            errors.push("Command queue limit must be greater than 0".to_string());
        } else if self.command_queue_limit > 1_000_000 {
            errors.push(format!(
                "Command queue limit too large: {} (max recommended: 1,000,000)",
                self.command_queue_limit
            ));
        }

        errors
    }
}

/// SASL mechanism used during authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanismKind {
    #[default]
    External,
    Anonymous,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub mechanism: AuthMechanismKind,

    /// Uid sent with EXTERNAL (defaults to the process uid)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// Send an empty initial response and answer the server's DATA challenge
    pub empty_initial_response: bool,

    /// Request unix fd passing after OK
    pub negotiate_unix_fd: bool,

    /// Timeout for the whole line exchange
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mechanism: AuthMechanismKind::External,
            uid: None,
            empty_initial_response: false,
            negotiate_unix_fd: NEGOTIATE_UNIX_FD,
            timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl AuthConfig {
    /// Validate authentication configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mechanism == AuthMechanismKind::Anonymous {
            if self.negotiate_unix_fd {
                errors.push(
                    "Anonymous authentication cannot negotiate unix fd passing".to_string(),
                );
            }
            if self.uid.is_some() {
                errors.push("A uid is only meaningful with external authentication".to_string());
            }
        }

        if self.empty_initial_response && self.uid.is_some() {
            errors.push("empty_initial_response and an explicit uid are mutually exclusive".to_string());
        }

        if self.timeout.as_millis() < 100 {
            errors.push("Auth timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout.as_secs() > 300 {
            errors.push("Auth timeout too long (maximum: 300s)".to_string());
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("dbus-wire"),
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
                if let Some(parent) = std::path::Path::new(path).parent() {
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

/// Optional durations, in milliseconds
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
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
