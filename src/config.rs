//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{LinkError, Result};
use crate::filter::MAX_CAPTURE_LEN;
use crate::link::socket::MAX_INTERFACE_NAME_LEN;
use crate::protocol::addressing::{CommId, Direction, OperatingMode, Port};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub link: LinkConfig,

    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Link addressing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    pub interface: String,

    #[serde(default = "default_mode")]
    pub mode: OperatingMode,

    #[serde(default = "default_comm_id")]
    pub comm_id: CommId,

    #[serde(default = "default_direction")]
    pub direction: Direction,

    #[serde(default = "default_port")]
    pub port: Port,
}

/// Receive socket configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SocketConfig {
    #[serde(default = "default_nonblocking")]
    pub nonblocking: bool,

    #[serde(default)]
    pub receive_timeout_ms: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub directory: String,
}

// Default value functions
fn default_mode() -> OperatingMode { OperatingMode::Monitor }
fn default_comm_id() -> CommId { CommId::new([0xAA, 0xBB, 0xCC, 0xDD]) }
fn default_direction() -> Direction { Direction::TowardOperator }
fn default_port() -> Port { Port::TELEMETRY }

fn default_nonblocking() -> bool { true }
fn default_buffer_size() -> usize { 2048 }

fn default_log_level() -> String { "info".to_string() }

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nonblocking: default_nonblocking(),
            receive_timeout_ms: 0,
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
        }
    }
}

impl SocketConfig {
    /// Receive timeout split into the (seconds, microseconds) pair of `SO_RCVTIMEO`
    pub fn receive_timeout(&self) -> (u32, u32) {
        let secs = (self.receive_timeout_ms / 1000) as u32;
        let micros = ((self.receive_timeout_ms % 1000) * 1000) as u32;
        (secs, micros)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails (including a malformed `comm_id` or `mode`)
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use db_link::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        let interface = &self.link.interface;
        if interface.is_empty() {
            return Err(LinkError::Config(toml::de::Error::custom("interface cannot be empty")));
        }

        if interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(LinkError::Config(toml::de::Error::custom(format!(
                "interface name '{}' exceeds {} bytes",
                interface, MAX_INTERFACE_NAME_LEN
            ))));
        }

        if self.socket.receive_timeout_ms > 60000 {
            return Err(LinkError::Config(toml::de::Error::custom(
                "receive_timeout_ms must be between 0 and 60000",
            )));
        }

        if !self.socket.nonblocking && self.socket.receive_timeout_ms == 0 {
            return Err(LinkError::Config(toml::de::Error::custom(
                "receive_timeout_ms must be set when nonblocking = false",
            )));
        }

        if self.socket.buffer_size < 64 || self.socket.buffer_size > MAX_CAPTURE_LEN as usize {
            return Err(LinkError::Config(toml::de::Error::custom(format!(
                "buffer_size must be between 64 and {}",
                MAX_CAPTURE_LEN
            ))));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(LinkError::Config(toml::de::Error::custom(
                "log level must be one of: trace, debug, info, warn, error",
            )));
        }

        Ok(())
    }
}
