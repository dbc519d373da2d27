//! Sensor names for hardware addresses, read from the device list file.
//!
//! File format (YAML-like list):
//!
//! ```text
//! - name: fridge
//!   addr: 00:12:4B:00:01:02:03:04
//! - name: washer
//!   addr: 00:12:4b:00:01:02:03:05
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::config::parse_string_value;
use crate::types::{HardwareAddress, HemsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub addr: HardwareAddress,
}

/// Device list, reloaded only when the file's mtime changes.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    /// Registry with a fixed list and no backing file.
    pub fn from_devices(devices: Vec<DeviceInfo>) -> Self {
        DeviceRegistry {
            path: None,
            mtime: None,
            devices,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = DeviceRegistry {
            path: Some(path.into()),
            mtime: None,
            devices: Vec::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Re-read the file if it changed since the last load. Returns true on reload.
    pub fn reload(&mut self) -> Result<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };

        let mtime = fs::metadata(&path)?.modified()?;
        if self.mtime == Some(mtime) {
            return Ok(false);
        }

        info!("Load device list...");
        let text = fs::read_to_string(&path)?;
        self.devices = parse_device_list(&text)?;
        self.mtime = Some(mtime);
        info!("{} device(s) defined in {}", self.devices.len(), path.display());
        Ok(true)
    }

    pub fn name_of(&self, addr: &HardwareAddress) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.addr == *addr)
            .map(|d| d.name.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }
}

/// Parse the device list text.
pub fn parse_device_list(text: &str) -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();
    let mut name: Option<String> = None;
    let mut addr: Option<HardwareAddress> = None;
    let mut started = false;

    let mut finish = |name: &mut Option<String>, addr: &mut Option<HardwareAddress>| -> Result<()> {
        match (name.take(), addr.take()) {
            (Some(n), Some(a)) => {
                devices.push(DeviceInfo { name: n, addr: a });
                Ok(())
            }
            (n, _) => Err(HemsError::Config(format!(
                "device entry {} lacks name or addr",
                n.unwrap_or_else(|| "<unnamed>".into())
            ))),
        }
    };

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let entry = if let Some(rest) = stripped.strip_prefix("- ") {
            if started {
                finish(&mut name, &mut addr)?;
            }
            started = true;
            rest.trim()
        } else {
            stripped
        };

        let Some((key, val)) = entry.split_once(':') else {
            warn!("Ignoring device list line: {stripped}");
            continue;
        };
        match key.trim() {
            "name" => name = parse_string_value(val.trim()),
            "addr" => {
                if let Some(v) = parse_string_value(val.trim()) {
                    addr = Some(v.parse()?);
                }
            }
            _ => {}
        }
    }

    if started {
        finish(&mut name, &mut addr)?;
    }

    Ok(devices)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
