//! # Frame Addressing Model
//!
//! Fixed-offset header fields every DroneBridge participant must agree on.
//!
//! A monitor-mode capture starts with a radiotap header of variable length
//! (little-endian `u16` at byte 2). All DroneBridge offsets are relative to
//! the first byte of the 802.11 header that follows it:
//!
//! ```text
//! offset  width  field
//!   0       1    frame control (type/subtype)
//!   4       1    address-1 marker, always 0x01
//!   5       1    direction
//!   6       4    communication id (big-endian)
//!  16       1    protocol version
//!  17       1    port
//!  18       1    direction confirmation
//! ```
//!
//! There is no checksum or self-description covering these offsets. A sender
//! and a receiver that disagree on any of them silently lose traffic.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Current DroneBridge raw protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Ether-type used for WIFI_COMPAT framing
pub const ETHER_TYPE_DB: u16 = 0x88AB;

/// Ether-type selecting LLC 802.2 frames (MONITOR framing)
pub const ETH_P_802_2: u16 = 0x0004;

/// Offset of the radiotap `it_len` field from the start of the capture
pub const RADIOTAP_LEN_OFFSET: u32 = 2;

/// 802.11 frame control byte
pub const OFFSET_FRAME_CONTROL: u32 = 0;

/// Address-1 marker byte (group bit set)
pub const OFFSET_ADDR_MARKER: u32 = 4;

/// Direction byte inside address 1
pub const OFFSET_DIRECTION: u32 = 5;

/// First byte of the 4-byte communication id
pub const OFFSET_COMM_ID: u32 = 6;

/// Protocol version byte
pub const OFFSET_VERSION: u32 = 16;

/// Port byte
pub const OFFSET_PORT: u32 = 17;

/// Direction confirmation byte
pub const OFFSET_DIRECTION_CONFIRM: u32 = 18;

/// Bytes of 802.11 header the DroneBridge fields span
pub const DB_HEADER_MIN_LEN: usize = OFFSET_DIRECTION_CONFIRM as usize + 1;

/// Value of the address-1 marker byte
pub const ADDR_MARKER: u8 = 0x01;

/// Frame control bit tested for data frames
pub const FRAME_CONTROL_DATA: u8 = 0x08;

/// Frame control bit tested for beacon frames
pub const FRAME_CONTROL_BEACON: u8 = 0x80;

/// Communication id shared by all participants of one link instance
///
/// Acts as a network selector so that independent links on the same radio
/// channel do not see each other's traffic. Not a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct CommId([u8; 4]);

impl CommId {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Big-endian packing, as compared by the kernel filter
    pub const fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl From<[u8; 4]> for CommId {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{:02x} {:02x} {:02x} {:02x}", a, b, c, d)
    }
}

impl FromStr for CommId {
    type Err = String;

    /// Parse 8 hex digits, e.g. `aabbccdd` or `0xAABBCCDD`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s
            .trim()
            .strip_prefix("0x")
            .or_else(|| s.trim().strip_prefix("0X"))
            .unwrap_or(s.trim());

        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("communication id '{}' must be 8 hex digits", s));
        }

        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("communication id '{}' is not valid hex", s))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CommId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which endpoint a frame travels toward
///
/// A receiver passes its own role's incoming direction: the vehicle listens
/// for `TowardVehicle`, the ground station for `TowardOperator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ground station to drone
    TowardVehicle = 0x01,
    /// Drone to ground station
    TowardOperator = 0x03,
}

impl Direction {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub const fn opposite(self) -> Self {
        match self {
            Direction::TowardVehicle => Direction::TowardOperator,
            Direction::TowardOperator => Direction::TowardVehicle,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Direction::TowardVehicle),
            0x03 => Some(Direction::TowardOperator),
            _ => None,
        }
    }
}

/// Logical channel multiplexed over the link
///
/// Any byte is representable; the constants name the modules in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct Port(pub u8);

impl Port {
    pub const CONTROLLER: Port = Port(0x01);
    pub const TELEMETRY: Port = Port(0x02);
    pub const VIDEO: Port = Port(0x03);
    pub const COMMUNICATION: Port = Port(0x04);
    pub const STATUS: Port = Port(0x05);
    pub const PROXY: Port = Port(0x06);
    pub const RC: Port = Port(0x07);

    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Module name for logging, `None` for unassigned ports
    pub fn name(self) -> Option<&'static str> {
        match self {
            Port::CONTROLLER => Some("controller"),
            Port::TELEMETRY => Some("telemetry"),
            Port::VIDEO => Some("video"),
            Port::COMMUNICATION => Some("communication"),
            Port::STATUS => Some("status"),
            Port::PROXY => Some("proxy"),
            Port::RC => Some("rc"),
            _ => None,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02x})", name, self.0),
            None => write!(f, "0x{:02x}", self.0),
        }
    }
}

/// How the radio is driven for one process invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum OperatingMode {
    /// Ethernet-style framing, promiscuous capture, no kernel filter
    WifiCompat,
    /// Raw 802.11 framing with the kernel filter attached before bind
    Monitor,
}

impl OperatingMode {
    /// Map the single-character selector (`'w'` / `'m'`)
    pub fn from_selector(selector: char) -> Option<Self> {
        match selector {
            'w' => Some(OperatingMode::WifiCompat),
            'm' => Some(OperatingMode::Monitor),
            _ => None,
        }
    }

    pub const fn selector(self) -> char {
        match self {
            OperatingMode::WifiCompat => 'w',
            OperatingMode::Monitor => 'm',
        }
    }

    /// Ether-type the socket is opened and bound with
    pub const fn ether_type(self) -> u16 {
        match self {
            OperatingMode::WifiCompat => ETHER_TYPE_DB,
            OperatingMode::Monitor => ETH_P_802_2,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::WifiCompat => f.write_str("wifi"),
            OperatingMode::Monitor => f.write_str("monitor"),
        }
    }
}

impl FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "w" | "wifi" => Ok(OperatingMode::WifiCompat),
            "m" | "monitor" => Ok(OperatingMode::Monitor),
            other => Err(format!("unknown mode '{}' (expected 'w' or 'm')", other)),
        }
    }
}

impl TryFrom<String> for OperatingMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_fixed() {
        assert_eq!(OFFSET_FRAME_CONTROL, 0);
        assert_eq!(OFFSET_ADDR_MARKER, 4);
        assert_eq!(OFFSET_DIRECTION, 5);
        assert_eq!(OFFSET_COMM_ID, 6);
        assert_eq!(OFFSET_VERSION, 16);
        assert_eq!(OFFSET_PORT, 17);
        assert_eq!(OFFSET_DIRECTION_CONFIRM, 18);
        assert_eq!(DB_HEADER_MIN_LEN, 19);
    }

    #[test]
    fn test_comm_id_big_endian() {
        assert_eq!(CommId::new([0xAA, 0xBB, 0xCC, 0xDD]).as_u32(), 0xAABBCCDD);
        assert_eq!(CommId::new([0, 0, 0, 0]).as_u32(), 0);
        assert_eq!(CommId::new([0xFF; 4]).as_u32(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_comm_id_parse() {
        let id: CommId = "aabbccdd".parse().unwrap();
        assert_eq!(id.bytes(), [0xAA, 0xBB, 0xCC, 0xDD]);

        let id: CommId = "0x01020304".parse().unwrap();
        assert_eq!(id.bytes(), [1, 2, 3, 4]);

        assert!("aabbcc".parse::<CommId>().is_err());
        assert!("aabbccddee".parse::<CommId>().is_err());
        assert!("zzbbccdd".parse::<CommId>().is_err());
        assert!("aabbccdé".parse::<CommId>().is_err());
    }

    #[test]
    fn test_comm_id_display() {
        let id = CommId::new([0xAA, 0x0B, 0xCC, 0x0D]);
        assert_eq!(id.to_string(), "aa 0b cc 0d");
    }

    #[test]
    fn test_direction_bytes() {
        assert_eq!(Direction::TowardVehicle.as_byte(), 0x01);
        assert_eq!(Direction::TowardOperator.as_byte(), 0x03);
        assert_eq!(Direction::TowardVehicle.opposite(), Direction::TowardOperator);
        assert_eq!(Direction::from_byte(0x03), Some(Direction::TowardOperator));
        assert_eq!(Direction::from_byte(0x02), None);
    }

    #[test]
    fn test_port_names() {
        assert_eq!(Port::CONTROLLER.name(), Some("controller"));
        assert_eq!(Port(0x42).name(), None);
        assert_eq!(Port::TELEMETRY.to_string(), "telemetry (0x02)");
        assert_eq!(Port(0x42).to_string(), "0x42");
    }

    #[test]
    fn test_operating_mode_selectors() {
        assert_eq!(OperatingMode::from_selector('w'), Some(OperatingMode::WifiCompat));
        assert_eq!(OperatingMode::from_selector('m'), Some(OperatingMode::Monitor));
        assert_eq!(OperatingMode::from_selector('x'), None);
        assert_eq!(OperatingMode::Monitor.selector(), 'm');
        assert_eq!("monitor".parse::<OperatingMode>(), Ok(OperatingMode::Monitor));
        assert_eq!("W".parse::<OperatingMode>(), Ok(OperatingMode::WifiCompat));
        assert!("ap".parse::<OperatingMode>().is_err());
    }

    #[test]
    fn test_ether_types() {
        assert_eq!(OperatingMode::WifiCompat.ether_type(), 0x88AB);
        assert_eq!(OperatingMode::Monitor.ether_type(), 0x0004);
    }
}
