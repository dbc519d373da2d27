//! Relay subscriber: reads `serial <header> <payload>` lines over TCP.
//!
//! A dropped connection (feeder restart, network blip) is re-established
//! with exponential backoff until shutdown is requested.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hems_core::frame::RELAY_CHANNEL;
use hems_core::{RawFrame, RelayMessage};

/// A received relay line and the frame it carries.
#[derive(Debug, Clone)]
pub struct RelayLine {
    pub line: String,
    pub frame: RawFrame,
}

/// First reconnect delay; doubled per failed attempt.
pub const RECONNECT_MIN: Duration = Duration::from_millis(500);
/// Upper bound on the reconnect delay.
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct RelaySubscriber {
    addr: String,
    lines: Option<Lines<BufReader<TcpStream>>>,
    pub malformed: u64,
    pub reconnects: u64,
}

impl RelaySubscriber {
    /// Connect once. Failing here is fatal; later drops are retried.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr).await?;
        info!("Subscribed to relay at {addr}");
        Ok(RelaySubscriber {
            addr,
            lines: Some(BufReader::new(stream).lines()),
            malformed: 0,
            reconnects: 0,
        })
    }

    /// Reconnect with backoff. Returns false if shutdown came first.
    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut delay = RECONNECT_MIN;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!("Resubscribed to relay at {}", self.addr);
                    self.lines = Some(BufReader::new(stream).lines());
                    self.reconnects += 1;
                    return true;
                }
                Err(e) => {
                    warn!("Relay {} unreachable: {e}", self.addr);
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    /// Next frame on the serial channel.
    ///
    /// Returns `None` only once shutdown is requested. Lines for other
    /// channels are ignored; malformed lines are logged and skipped.
    pub async fn next(&mut self, shutdown: &mut watch::Receiver<bool>) -> io::Result<Option<RelayLine>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let Some(lines) = self.lines.as_mut() else {
                if !self.reconnect(shutdown).await {
                    return Ok(None);
                }
                continue;
            };

            let line = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                    continue;
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    warn!("Relay closed the connection");
                    self.lines = None;
                    continue;
                }
                Err(e) => {
                    warn!("Relay read failed: {e}");
                    self.lines = None;
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let channel = trimmed.split(' ').next().unwrap_or("");
            if channel != RELAY_CHANNEL {
                debug!("Ignoring message on channel {channel:?}");
                continue;
            }

            match RelayMessage::parse(trimmed) {
                Ok(frame) => {
                    return Ok(Some(RelayLine {
                        line: trimmed.to_string(),
                        frame,
                    }))
                }
                Err(e) => {
                    warn!("Malformed relay message {trimmed:?}: {e}");
                    self.malformed += 1;
                }
            }
        }
    }
}
