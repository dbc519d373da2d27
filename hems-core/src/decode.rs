//! Decode relay frames into typed events.
//!
//! Handles the three frame types the relay emits:
//! - 0x08: hardware address announce (collected into a pending list)
//! - 0x12: numeric id announce (pairs an id with a pending address by index)
//! - 0x2C: power measurement (cumulative energy counter and tick timestamp)
//!
//! Address and id announces arrive in bursts. The n-th id announce refers to
//! the n-th address of the burst; nothing else ties them together, so the
//! pending list is cleared once the id announce for its last index arrives.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::frame::{FrameKind, HEADER_LEN};
use crate::identity::{IdentityMap, IdentityStore};
use crate::types::*;

/// Multiplier applied to derived watts; the raw readings run low against a
/// reference meter.
pub const DEFAULT_WATT_SCALE: f64 = 1.5;

// Fixed little-endian offsets into header + payload.
const ADDR_RANGE: std::ops::Range<usize> = 4..12;
const ANNOUNCE_ID_RANGE: std::ops::Range<usize> = 4..6;
const ANNOUNCE_INDEX: usize = 6;
const MEASURE_ID_RANGE: std::ops::Range<usize> = 5..7;
const MEASURE_COUNTER: usize = 14;
const CUR_TIME_RANGE: std::ops::Range<usize> = 19..21;
const CUR_POWER_RANGE: std::ops::Range<usize> = 26..30;
const PRE_TIME_RANGE: std::ops::Range<usize> = 35..37;
const PRE_POWER_RANGE: std::ops::Range<usize> = 42..46;

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

/// Id announce fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdAnnounce {
    pub dev_id: u16,
    pub index: u8,
}

/// Raw measurement fields before duplicate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasureFields {
    pub dev_id: u16,
    pub counter: u8,
    pub cur_time: u16,
    pub cur_power: u32,
    pub pre_time: u16,
    pub pre_power: u32,
}

fn read_u16(packet: &[u8], range: std::ops::Range<usize>) -> Option<u16> {
    let bytes: [u8; 2] = packet.get(range)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

fn read_u32(packet: &[u8], range: std::ops::Range<usize>) -> Option<u32> {
    let bytes: [u8; 4] = packet.get(range)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Hardware address carried by an address announce.
pub fn parse_address(packet: &[u8]) -> Option<HardwareAddress> {
    HardwareAddress::from_wire(packet.get(ADDR_RANGE)?)
}

pub fn parse_id_announce(packet: &[u8]) -> Option<IdAnnounce> {
    Some(IdAnnounce {
        dev_id: read_u16(packet, ANNOUNCE_ID_RANGE)?,
        index: *packet.get(ANNOUNCE_INDEX)?,
    })
}

pub fn parse_measure(packet: &[u8]) -> Option<MeasureFields> {
    Some(MeasureFields {
        dev_id: read_u16(packet, MEASURE_ID_RANGE)?,
        counter: *packet.get(MEASURE_COUNTER)?,
        cur_time: read_u16(packet, CUR_TIME_RANGE)?,
        cur_power: read_u32(packet, CUR_POWER_RANGE)?,
        pre_time: read_u16(packet, PRE_TIME_RANGE)?,
        pre_power: read_u32(packet, PRE_POWER_RANGE)?,
    })
}

/// Average watts over the reading interval.
///
/// Both counters wrap (16-bit ticks, 32-bit energy), so differences are
/// taken modulo their width. Returns `None` for a zero tick delta, which
/// only a rebroadcast produces.
pub fn compute_watt(fields: &MeasureFields, scale: f64) -> Option<f64> {
    let dif_time = fields.cur_time.wrapping_sub(fields.pre_time);
    if dif_time == 0 {
        return None;
    }
    let dif_power = fields.cur_power.wrapping_sub(fields.pre_power);
    Some(round2(dif_power as f64 / dif_time as f64 * scale))
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Stateful frame decoder.
///
/// Owns the identity mapping (loaded once from the store and flushed back on
/// every change), the pending address list of the current announce burst,
/// and the last sequence counter seen per id.
pub struct PacketDecoder<S: IdentityStore> {
    store: S,
    mapping: IdentityMap,
    pending: Vec<HardwareAddress>,
    counter_hist: HashMap<u16, u8>,
    watt_scale: f64,

    // Counters
    pub total_frames: u64,
    pub measurements: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

impl<S: IdentityStore> PacketDecoder<S> {
    pub fn new(store: S, watt_scale: f64) -> Self {
        let mapping = store.load();
        info!("Loaded {} dev_id mapping(s)", mapping.len());
        PacketDecoder {
            store,
            mapping,
            pending: Vec::new(),
            counter_hist: HashMap::new(),
            watt_scale,
            total_frames: 0,
            measurements: 0,
            duplicates: 0,
            rejected: 0,
        }
    }

    pub fn mapping(&self) -> &IdentityMap {
        &self.mapping
    }

    pub fn pending(&self) -> &[HardwareAddress] {
        &self.pending
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume one frame.
    ///
    /// `Ok(None)` means the frame was consumed without an event: malformed,
    /// short, or a duplicate reading. The only error is a failed identity
    /// store write, which the caller must see.
    pub fn decode(&mut self, header: &[u8], payload: &[u8]) -> Result<Option<Event>> {
        self.total_frames += 1;

        let header: [u8; HEADER_LEN] = match header.try_into() {
            Ok(h) => h,
            Err(_) => {
                warn!("Invalid header: {}", dump_packet(header));
                self.rejected += 1;
                return Ok(None);
            }
        };

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);

        match FrameKind::from_header(&header) {
            FrameKind::AddressAnnounce => {
                debug!("IEEE addr payload: {}", dump_packet(payload));
                Ok(self.on_address(&packet))
            }
            FrameKind::IdAnnounce => {
                debug!("Dev ID payload: {}", dump_packet(payload));
                self.on_id_announce(&packet)
            }
            FrameKind::Measurement => {
                debug!("Measure payload: {}", dump_packet(payload));
                Ok(self.on_measure(&packet))
            }
            FrameKind::Unknown(kind) => {
                debug!("Unknown packet: {}", dump_packet(&packet));
                Ok(Some(Event::Unknown { kind }))
            }
        }
    }

    fn on_address(&mut self, packet: &[u8]) -> Option<Event> {
        let Some(address) = parse_address(packet) else {
            warn!("Invalid packet: {}", dump_packet(packet));
            self.rejected += 1;
            return None;
        };
        self.pending.push(address);
        Some(Event::AddressAnnounce { address })
    }

    fn on_id_announce(&mut self, packet: &[u8]) -> Result<Option<Event>> {
        let Some(IdAnnounce { dev_id, index }) = parse_id_announce(packet) else {
            warn!("Invalid packet: {}", dump_packet(packet));
            self.rejected += 1;
            return Ok(None);
        };

        let (change, update) = match self.pending.get(index as usize).copied() {
            Some(candidate) => match self.mapping.get(&dev_id) {
                None => {
                    info!("Find IEEE addr for dev_id=0x{dev_id:04X}: {candidate}");
                    (MappingChange::Learned, Some(candidate))
                }
                Some(stored) if *stored != candidate => {
                    info!("Update IEEE addr for dev_id=0x{dev_id:04X}: {stored} -> {candidate}");
                    (MappingChange::Updated, Some(candidate))
                }
                Some(_) => (MappingChange::Unchanged, None),
            },
            None => {
                warn!(
                    "Unable to identify IEEE addr for dev_id=0x{dev_id:04X} (index {index}, {} pending)",
                    self.pending.len()
                );
                (MappingChange::Unresolved, None)
            }
        };

        if !self.pending.is_empty() && index as usize == self.pending.len() - 1 {
            debug!("Clear IEEE addr list");
            self.pending.clear();
        }

        if let Some(candidate) = update {
            let previous = self.mapping.insert(dev_id, candidate);
            if let Err(e) = self.flush() {
                // The in-memory map never runs ahead of the store.
                match previous {
                    Some(stored) => self.mapping.insert(dev_id, stored),
                    None => self.mapping.remove(&dev_id),
                };
                return Err(e);
            }
        }

        Ok(Some(Event::IdAnnounce {
            dev_id,
            index,
            change,
        }))
    }

    fn on_measure(&mut self, packet: &[u8]) -> Option<Event> {
        let Some(fields) = parse_measure(packet) else {
            warn!("Invalid packet: {}", dump_packet(packet));
            self.rejected += 1;
            return None;
        };

        // The relay sometimes sends the same reading twice; the counter byte
        // only advances on a new reading.
        if self.counter_hist.get(&fields.dev_id) == Some(&fields.counter) {
            info!("Packet duplication detected");
            self.duplicates += 1;
            return None;
        }
        self.counter_hist.insert(fields.dev_id, fields.counter);

        let Some(watt) = compute_watt(&fields, self.watt_scale) else {
            info!("Packet duplication detected");
            self.duplicates += 1;
            return None;
        };

        let address = self.mapping.get(&fields.dev_id).copied();
        if address.is_none() {
            warn!("dev_id = 0x{:04X} is unknown", fields.dev_id);
            warn!("dev_id map = {}", self.mapping_table());
        }

        let event = MeasurementEvent {
            address,
            dev_id: fields.dev_id,
            cur_time: fields.cur_time,
            cur_power: fields.cur_power,
            pre_time: fields.pre_time,
            pre_power: fields.pre_power,
            watt,
        };
        debug!("Receive packet: {event:?}");
        self.measurements += 1;

        Some(Event::Measurement(event))
    }

    fn flush(&mut self) -> Result<()> {
        self.store.store(&self.mapping).inspect_err(|e| {
            tracing::error!("Failed to store dev_id map: {e}");
        })
    }

    fn mapping_table(&self) -> String {
        let table: serde_json::Map<String, serde_json::Value> = self
            .mapping
            .iter()
            .map(|(id, addr)| (format!("0x{id:04X}"), addr.to_string().into()))
            .collect();
        serde_json::to_string_pretty(&table).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
