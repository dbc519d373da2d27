//! Frame layout of the relay's serial protocol and the relay wire codec.
//!
//! Responsibilities:
//! - Classify frames by `header[1]` (type and length selector)
//! - Split a raw byte stream into frames (`FrameReader`)
//! - Encode/parse the `"serial <header_hex> <payload_hex>"` relay line

use std::io::{self, Read};

use tracing::debug;

use crate::types::{hex_decode, hex_encode, HemsError, Result};

/// Header bytes preceding every payload.
pub const HEADER_LEN: usize = 2;

/// `header[1]` of a hardware address announce.
pub const KIND_ADDRESS: u8 = 0x08;
/// `header[1]` of a numeric id announce.
pub const KIND_DEV_ID: u8 = 0x12;
/// `header[1]` of a power measurement.
pub const KIND_MEASURE: u8 = 0x2C;

/// Relay channel every frame is published on.
pub const RELAY_CHANNEL: &str = "serial";

/// Payload bytes following a header.
pub fn payload_len(header: &[u8; HEADER_LEN]) -> usize {
    header[1] as usize + 3
}

// ---------------------------------------------------------------------------
// Frame kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    AddressAnnounce,
    IdAnnounce,
    Measurement,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_header(header: &[u8; HEADER_LEN]) -> Self {
        match header[1] {
            KIND_ADDRESS => FrameKind::AddressAnnounce,
            KIND_DEV_ID => FrameKind::IdAnnounce,
            KIND_MEASURE => FrameKind::Measurement,
            other => FrameKind::Unknown(other),
        }
    }
}

// ---------------------------------------------------------------------------
// RawFrame
// ---------------------------------------------------------------------------

/// One frame as read off the line. Not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: [u8; HEADER_LEN],
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn new(header: [u8; HEADER_LEN], payload: Vec<u8>) -> Self {
        RawFrame { header, payload }
    }

    /// Header and payload concatenated; all field offsets index into this.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out
    }
}

// ---------------------------------------------------------------------------
// Stream splitting
// ---------------------------------------------------------------------------

/// Result of one read attempt on the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing arrived (serial timeout or end of input).
    Idle,
    /// A single stray byte arrived where a header was expected.
    Short,
    Frame(RawFrame),
}

/// Splits a byte stream into frames using the header length selector.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next frame.
    ///
    /// A payload cut short by a timeout is still returned; the decoder
    /// rejects it with a log line.
    pub fn read_frame(&mut self) -> io::Result<ReadOutcome> {
        let mut header = [0u8; HEADER_LEN];
        let got = read_up_to(&mut self.inner, &mut header)?;
        match got {
            0 => return Ok(ReadOutcome::Idle),
            1 => {
                debug!("Short packet");
                return Ok(ReadOutcome::Short);
            }
            _ => {}
        }

        let mut payload = Vec::with_capacity(payload_len(&header));
        (&mut self.inner)
            .take(payload_len(&header) as u64)
            .read_to_end(&mut payload)?;

        Ok(ReadOutcome::Frame(RawFrame::new(header, payload)))
    }
}

/// Fill `buf` until full, end of input, or a zero-length (timed out) read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Relay wire message
// ---------------------------------------------------------------------------

/// The UTF-8 line carried by the relay transport.
pub struct RelayMessage;

impl RelayMessage {
    pub fn encode(frame: &RawFrame) -> String {
        format!(
            "{RELAY_CHANNEL} {} {}",
            hex_encode(&frame.header),
            hex_encode(&frame.payload)
        )
    }

    pub fn parse(line: &str) -> Result<RawFrame> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');
        let channel = parts.next().unwrap_or("");
        if channel != RELAY_CHANNEL {
            return Err(HemsError::InvalidMessage(format!(
                "unexpected channel {channel:?}"
            )));
        }
        let (header_hex, payload_hex) = match (parts.next(), parts.next()) {
            (Some(h), Some(p)) => (h, p),
            (Some(h), None) => (h, ""),
            _ => return Err(HemsError::InvalidMessage("missing header field".into())),
        };

        let header = hex_decode(header_hex)
            .ok_or_else(|| HemsError::InvalidHex(header_hex.to_string()))?;
        let header: [u8; HEADER_LEN] =
            header
                .as_slice()
                .try_into()
                .map_err(|_| HemsError::ShortFrame {
                    expected: HEADER_LEN,
                    actual: header.len(),
                })?;
        let payload = hex_decode(payload_hex)
            .ok_or_else(|| HemsError::InvalidHex(payload_hex.to_string()))?;

        Ok(RawFrame::new(header, payload))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
