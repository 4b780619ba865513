//! # Error Types
//!
//! Custom error types for DB Link using `thiserror`.

use std::io;

use thiserror::Error;

use crate::protocol::addressing::OperatingMode;

/// Main error type for DB Link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Raw socket could not be opened (missing privilege, resource exhaustion)
    #[error("Failed to create {mode} raw socket: {source}")]
    SocketCreateFailed {
        mode: OperatingMode,
        #[source]
        source: io::Error,
    },

    /// Named interface does not exist on this host
    #[error("Network interface '{interface}' not found: {source}")]
    InterfaceNotFound {
        interface: String,
        #[source]
        source: io::Error,
    },

    /// Reading or writing interface flags failed
    #[error("Failed to control interface '{interface}': {source}")]
    InterfaceControlFailed {
        interface: String,
        #[source]
        source: io::Error,
    },

    /// Kernel rejected the filter program
    #[error("Could not attach BPF filter: {source}")]
    FilterAttachFailed {
        #[source]
        source: io::Error,
    },

    /// Binding to the interface/protocol pair failed
    #[error("Failed to bind socket to '{interface}': {source}")]
    BindFailed {
        interface: String,
        #[source]
        source: io::Error,
    },

    /// A descriptor option could not be applied
    #[error("Failed to set socket option {option}: {source}")]
    ConfigFailed {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// Captured frame is too short or malformed
    #[error("Frame error: {0}")]
    Frame(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Underlying OS error, if this failure came from a system call
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            LinkError::SocketCreateFailed { source, .. }
            | LinkError::InterfaceNotFound { source, .. }
            | LinkError::InterfaceControlFailed { source, .. }
            | LinkError::FilterAttachFailed { source }
            | LinkError::BindFailed { source, .. }
            | LinkError::ConfigFailed { source, .. }
            | LinkError::Io(source) => Some(source),
            LinkError::Frame(_) | LinkError::Config(_) => None,
        }
    }
}

/// Result type alias for DB Link
pub type Result<T> = std::result::Result<T, LinkError>;
