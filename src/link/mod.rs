//! # Link Module
//!
//! Raw socket setup for DroneBridge receivers.
//!
//! This module handles:
//! - Opening `AF_PACKET` sockets for WIFI_COMPAT and MONITOR framing
//! - Promiscuous mode, kernel filter attachment and interface binding
//! - Non-blocking and receive-timeout configuration
//! - One-call receive link setup

pub mod orchestrator;
pub mod socket;

pub use orchestrator::open_receive_link;
pub use socket::{resolve_interface_index, LinkSocket};
