//! Serial line and capture-file input.
//!
//! The serial device is opened raw at 8N1 with a read timeout, so a quiet
//! line surfaces as a timed-out read and the stop flag gets checked.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};

use tracing::{debug, info};

use hems_core::{FrameReader, RawFrame, ReadOutcome, RelayMessage};

/// What to do when a read returns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnIdle {
    /// Serial timeout: keep reading.
    Wait,
    /// End of a capture file: stop.
    Stop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub short: u64,
    pub idle: u64,
}

/// Blocking read timeout on the serial line.
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn open_serial(path: &Path, baud: u32) -> io::Result<Box<dyn SerialPort>> {
    let port = serialport::new(path.to_string_lossy(), baud)
        .timeout(SERIAL_TIMEOUT)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open()?;
    info!("Opened serial port {} at {baud} baud", path.display());
    Ok(port)
}

/// Read frames until `stop` is set, or until end of input with `OnIdle::Stop`.
pub fn capture<R: Read>(
    reader: &mut FrameReader<R>,
    stop: &AtomicBool,
    on_idle: OnIdle,
    mut on_frame: impl FnMut(RawFrame),
) -> io::Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    while !stop.load(Ordering::Relaxed) {
        match reader.read_frame()? {
            ReadOutcome::Frame(frame) => {
                stats.frames += 1;
                on_frame(frame);
            }
            ReadOutcome::Short => stats.short += 1,
            ReadOutcome::Idle => {
                stats.idle += 1;
                if on_idle == OnIdle::Stop {
                    break;
                }
                debug!("Serial read timed out");
            }
        }
    }
    Ok(stats)
}

/// Relay lines for every frame in a raw binary capture.
pub fn split_file(path: &Path) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let mut reader = FrameReader::new(BufReader::new(file));
    let stop = AtomicBool::new(false);
    let mut lines = Vec::new();
    capture(&mut reader, &stop, OnIdle::Stop, |frame| {
        lines.push(RelayMessage::encode(&frame));
    })?;
    Ok(lines)
}
