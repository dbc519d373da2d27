//! Shared types, error enum, and decoded event types for hems-core.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// All errors produced by hems-core.
#[derive(Debug, Error)]
pub enum HemsError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("short frame: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },
    #[error("invalid relay message: {0}")]
    InvalidMessage(String),
    #[error("invalid hardware address: {0}")]
    InvalidAddress(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HemsError>;

/// Name reported for measurements whose numeric id has no known address.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

// ---------------------------------------------------------------------------
// Hardware address
// ---------------------------------------------------------------------------

/// 8-byte device address, stored in canonical (display) order.
///
/// The wire carries the bytes least-significant first; the canonical form
/// reverses them and renders `AA:BB:CC:DD:EE:FF:00:11`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 8]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 8]) -> Self {
        HardwareAddress(bytes)
    }

    /// Build from 8 bytes in wire order. Returns `None` for other lengths.
    pub fn from_wire(wire: &[u8]) -> Option<Self> {
        let mut bytes: [u8; 8] = wire.try_into().ok()?;
        bytes.reverse();
        Some(HardwareAddress(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for HardwareAddress {
    type Err = HemsError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut bytes = [0u8; 8];
        let mut count = 0;
        for part in s.split(':') {
            if count == 8 || part.len() != 2 {
                return Err(HemsError::InvalidAddress(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| HemsError::InvalidAddress(s.to_string()))?;
            count += 1;
        }
        if count != 8 {
            return Err(HemsError::InvalidAddress(s.to_string()));
        }
        Ok(HardwareAddress(bytes))
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive, must be even length.
pub fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let high = hex_digit(chunk[0])?;
        let low = hex_digit(chunk[1])?;
        bytes.push((high << 4) | low);
    }
    Some(bytes)
}

/// Encode bytes as lowercase hex, the relay wire form.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Comma-separated uppercase byte dump for diagnostics.
pub fn dump_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Decoded events
// ---------------------------------------------------------------------------

/// One accepted power reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementEvent {
    /// Resolved hardware address, `None` when the id is not yet mapped.
    #[serde(rename = "addr", serialize_with = "serialize_resolved")]
    pub address: Option<HardwareAddress>,
    pub dev_id: u16,
    pub cur_time: u16,
    pub cur_power: u32,
    pub pre_time: u16,
    pub pre_power: u32,
    pub watt: f64,
}

impl MeasurementEvent {
    /// Address string, or `UNKNOWN` for unresolved ids.
    pub fn resolved_name(&self) -> String {
        match &self.address {
            Some(addr) => addr.to_string(),
            None => UNKNOWN_NAME.to_string(),
        }
    }

    pub fn dev_id_str(&self) -> String {
        format!("0x{:04X}", self.dev_id)
    }
}

fn serialize_resolved<S: Serializer>(
    address: &Option<HardwareAddress>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match address {
        Some(addr) => serializer.collect_str(addr),
        None => serializer.serialize_str(UNKNOWN_NAME),
    }
}

/// What an id announce did to the identity mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MappingChange {
    /// First address learned for this id.
    Learned,
    /// Id re-associated with a different address.
    Updated,
    /// Stored address already matched.
    Unchanged,
    /// Index outside the pending announce list.
    Unresolved,
}

/// Decoder output for one consumed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    AddressAnnounce {
        address: HardwareAddress,
    },
    IdAnnounce {
        dev_id: u16,
        index: u8,
        change: MappingChange,
    },
    Measurement(MeasurementEvent),
    Unknown {
        kind: u8,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
