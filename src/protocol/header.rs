//! # DroneBridge Header View
//!
//! Bounds-checked, read-only view over a captured monitor-mode frame.
//!
//! Frames reaching user space have already passed the kernel filter, but the
//! capture buffer is still foreign-controlled input. All field access goes
//! through [`RawFrameView`], which validates lengths once in [`RawFrameView::parse`].

use super::addressing::*;
use crate::error::{LinkError, Result};

/// Minimum radiotap header (`it_version`, `it_pad`, `it_len`, `it_present`)
pub const RADIOTAP_MIN_LEN: usize = 8;

/// Typed view over one captured frame
#[derive(Debug, Clone, Copy)]
pub struct RawFrameView<'a> {
    frame: &'a [u8],
    radiotap_len: usize,
}

impl<'a> RawFrameView<'a> {
    /// Validate a capture and build a view over it
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Frame` if:
    /// - The capture is shorter than a radiotap header
    /// - The radiotap length field is smaller than the radiotap minimum
    /// - The DroneBridge header does not fit after the radiotap header
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        if frame.len() < RADIOTAP_MIN_LEN {
            return Err(LinkError::Frame(format!(
                "Capture too short for radiotap header: {} bytes",
                frame.len()
            )));
        }

        let off = RADIOTAP_LEN_OFFSET as usize;
        let radiotap_len = u16::from_le_bytes([frame[off], frame[off + 1]]) as usize;
        if radiotap_len < RADIOTAP_MIN_LEN {
            return Err(LinkError::Frame(format!(
                "Invalid radiotap length: {}",
                radiotap_len
            )));
        }

        let needed = radiotap_len + DB_HEADER_MIN_LEN;
        if frame.len() < needed {
            return Err(LinkError::Frame(format!(
                "Frame too short: expected at least {} bytes, got {}",
                needed,
                frame.len()
            )));
        }

        Ok(Self { frame, radiotap_len })
    }

    pub fn radiotap_len(&self) -> usize {
        self.radiotap_len
    }

    /// The 802.11 part of the capture, radiotap stripped
    pub fn ieee80211(&self) -> &'a [u8] {
        &self.frame[self.radiotap_len..]
    }

    fn byte(&self, offset: u32) -> u8 {
        // parse() guarantees DB_HEADER_MIN_LEN bytes after radiotap
        self.ieee80211()[offset as usize]
    }

    pub fn frame_control(&self) -> u8 {
        self.byte(OFFSET_FRAME_CONTROL)
    }

    pub fn is_data(&self) -> bool {
        self.frame_control() & FRAME_CONTROL_DATA != 0
    }

    pub fn is_beacon(&self) -> bool {
        self.frame_control() & FRAME_CONTROL_BEACON != 0
    }

    pub fn addr_marker(&self) -> u8 {
        self.byte(OFFSET_ADDR_MARKER)
    }

    pub fn comm_id(&self) -> CommId {
        let start = OFFSET_COMM_ID as usize;
        let b = &self.ieee80211()[start..start + 4];
        CommId::new([b[0], b[1], b[2], b[3]])
    }

    /// Raw direction byte; not every value maps to a [`Direction`]
    pub fn direction_byte(&self) -> u8 {
        self.byte(OFFSET_DIRECTION)
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_byte(self.direction_byte())
    }

    pub fn version(&self) -> u8 {
        self.byte(OFFSET_VERSION)
    }

    pub fn port(&self) -> Port {
        Port(self.byte(OFFSET_PORT))
    }

    pub fn direction_confirm(&self) -> u8 {
        self.byte(OFFSET_DIRECTION_CONFIRM)
    }

    /// Check every addressing field against one receiver's triple
    ///
    /// Mirrors the kernel filter in user space, e.g. for WIFI_COMPAT captures
    /// that carry no kernel filter.
    pub fn matches(&self, comm_id: CommId, direction: Direction, port: Port) -> bool {
        (self.is_data() || self.is_beacon())
            && self.comm_id() == comm_id
            && self.addr_marker() == ADDR_MARKER
            && self.direction_byte() == direction.as_byte()
            && self.version() == PROTOCOL_VERSION
            && self.port() == port
            && self.direction_confirm() == direction.as_byte()
    }

    /// Everything after the fixed DroneBridge header fields
    pub fn tail(&self) -> &'a [u8] {
        &self.ieee80211()[DB_HEADER_MIN_LEN..]
    }
}
