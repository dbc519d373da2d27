//! Per-frame orchestration: decode, name, egress, liveness, heartbeat.

use std::io::{self, Write};
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use hems_core::device::DeviceRegistry;
use hems_core::liveness;
use hems_core::{Event, HemsError, IdentityStore, MeasurementEvent, PacketDecoder, RawFrame};

use crate::metrics::ReliabilityTracker;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] HemsError),

    #[error("metrics store: {0}")]
    Metrics(#[from] rusqlite::Error),

    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// One named reading handed downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub hostname: String,
    pub watt: i64,
}

/// Where named readings go.
pub trait MeasurementSink {
    fn send(&mut self, reading: &Reading) -> io::Result<()>;
}

/// Writes `{"hostname": ..., "<field>": watt}` JSON lines.
pub struct JsonLinesSink<W: Write> {
    out: W,
    field: String,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W, field: &str) -> Self {
        JsonLinesSink {
            out,
            field: field.to_string(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> MeasurementSink for JsonLinesSink<W> {
    fn send(&mut self, reading: &Reading) -> io::Result<()> {
        let mut record = Map::new();
        record.insert("hostname".into(), Value::from(reading.hostname.clone()));
        record.insert(self.field.clone(), Value::from(reading.watt));
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Dummy mode: log only.
#[derive(Debug, Default)]
pub struct LogSink;

impl MeasurementSink for LogSink {
    fn send(&mut self, reading: &Reading) -> io::Result<()> {
        info!(hostname = %reading.hostname, watt = reading.watt, "Measurement");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<S: IdentityStore, K: MeasurementSink> {
    decoder: PacketDecoder<S>,
    devices: DeviceRegistry,
    sink: K,
    tracker: Option<ReliabilityTracker>,
    liveness: Option<PathBuf>,
    grace_seconds: i64,
    max_events: Option<u64>,
    pub events: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub unnamed: u64,
}

impl<S: IdentityStore, K: MeasurementSink> Pipeline<S, K> {
    pub fn new(decoder: PacketDecoder<S>, devices: DeviceRegistry, sink: K) -> Self {
        Pipeline {
            decoder,
            devices,
            sink,
            tracker: None,
            liveness: None,
            grace_seconds: hems_core::slot::DEFAULT_GRACE_SECONDS,
            max_events: None,
            events: 0,
            sent: 0,
            send_failures: 0,
            unnamed: 0,
        }
    }

    pub fn with_tracker(mut self, tracker: ReliabilityTracker, grace_seconds: i64) -> Self {
        self.tracker = Some(tracker);
        self.grace_seconds = grace_seconds;
        self
    }

    pub fn with_liveness(mut self, path: impl Into<PathBuf>) -> Self {
        self.liveness = Some(path.into());
        self
    }

    /// Stop after this many measurement events; 0 means no limit.
    pub fn with_max_events(mut self, max: u64) -> Self {
        self.max_events = (max > 0).then_some(max);
        self
    }

    pub fn decoder(&self) -> &PacketDecoder<S> {
        &self.decoder
    }

    pub fn tracker(&self) -> Option<&ReliabilityTracker> {
        self.tracker.as_ref()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn is_done(&self) -> bool {
        self.max_events.is_some_and(|max| self.events >= max)
    }

    /// Run one frame through the pipeline at wall-clock time `now`.
    pub fn handle(&mut self, frame: &RawFrame, now: i64) -> Result<Option<Event>, PipelineError> {
        if let Err(e) = self.devices.reload() {
            warn!("Failed to reload device list: {e}");
        }

        let event = self.decoder.decode(&frame.header, &frame.payload)?;
        if let Some(Event::Measurement(m)) = &event {
            self.events += 1;
            self.on_measurement(m, now)?;
        }
        Ok(event)
    }

    fn on_measurement(&mut self, m: &MeasurementEvent, now: i64) -> Result<(), PipelineError> {
        let name = m
            .address
            .as_ref()
            .and_then(|addr| self.devices.name_of(addr))
            .map(str::to_string);
        let Some(name) = name else {
            warn!("Unknown device: dev_id = {}", m.dev_id_str());
            self.unnamed += 1;
            return Ok(());
        };

        let reading = Reading {
            hostname: name,
            watt: m.watt as i64,
        };
        // Egress failure loses the reading, not the heartbeat.
        match self.sink.send(&reading) {
            Ok(()) => {
                self.sent += 1;
                debug!("Send: {reading:?}");
                if let Some(path) = &self.liveness {
                    if let Err(e) = liveness::touch(path) {
                        warn!("Failed to update liveness file {}: {e}", path.display());
                    }
                }
            }
            Err(e) => {
                error!("Failed to send {}: {e}", reading.hostname);
                self.send_failures += 1;
            }
        }

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.record_heartbeat(&reading.hostname, now, self.grace_seconds)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
