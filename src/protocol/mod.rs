//! # DroneBridge Raw Protocol Module
//!
//! Wire contract shared by every participant of a DroneBridge link.
//!
//! This module handles:
//! - Link addressing (communication id, direction, port, protocol version)
//! - Fixed byte offsets of the DroneBridge header inside an 802.11 frame
//! - Bounds-checked access to the header fields of a captured frame

pub mod addressing;
pub mod header;

pub use addressing::{CommId, Direction, OperatingMode, Port, PROTOCOL_VERSION};
pub use header::RawFrameView;
