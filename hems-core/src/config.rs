//! Configuration file management for the wattmeter bridge.
//!
//! Reads a YAML-like `config.yaml` with device files, metrics database,
//! liveness file, relay endpoint, serial port, and failure webhook.

use std::path::{Path, PathBuf};

use crate::decode::DEFAULT_WATT_SCALE;
use crate::slot::SLOT_SECONDS;
use crate::types::{HemsError, Result};

/// Full configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceConfig,
    pub metrics: Option<MetricsConfig>,
    pub liveness: LivenessConfig,
    pub relay: RelayConfig,
    pub serial: SerialConfig,
    pub decoder: DecoderConfig,
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Sensor name / hardware address list.
    pub define: PathBuf,
    /// Persisted id → address map.
    pub cache: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub data: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Touched for every forwarded measurement.
    pub measure: PathBuf,
    /// Touched by the feeder for every frame read off the serial line.
    pub serial: PathBuf,
    /// Seconds a liveness file may go untouched before it counts as stale.
    pub interval: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: PathBuf,
    pub baud: u32,
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub watt_scale: f64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Minimum minutes between two failure notifications.
    pub interval_min: u64,
    pub stamp: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig {
                define: "device.yaml".into(),
                cache: "data/dev_id.json".into(),
            },
            metrics: None,
            liveness: LivenessConfig {
                measure: "/dev/shm/hems.healthz".into(),
                serial: "/dev/shm/hems-serial.healthz".into(),
                interval: SLOT_SECONDS as u64,
            },
            relay: RelayConfig {
                host: "localhost".into(),
                port: 4444,
            },
            serial: SerialConfig {
                port: "/dev/ttyUSB0".into(),
                baud: 115_200,
            },
            decoder: DecoderConfig {
                watt_scale: DEFAULT_WATT_SCALE,
            },
            webhook: None,
        }
    }
}

/// Load config from `path`.
///
/// A missing file yields the default config; an unreadable one is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| HemsError::Config(format!("{}: {e}", path.display())))?;
    Ok(parse_config(&text))
}

/// Parse simple YAML-like config text.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;
    let mut webhook_url: Option<String> = None;
    let mut webhook_interval: u64 = 60;
    let mut webhook_stamp: PathBuf = "data/webhook.stamp".into();

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = if val.is_empty() {
                Some(key.to_string())
            } else {
                None
            };
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        match (section, key) {
            ("device", "define") => {
                if let Some(v) = parse_string_value(val) {
                    config.device.define = v.into();
                }
            }
            ("device", "cache") => {
                if let Some(v) = parse_string_value(val) {
                    config.device.cache = v.into();
                }
            }
            ("metrics", "data") => {
                config.metrics = parse_string_value(val).map(|v| MetricsConfig { data: v.into() });
            }
            ("liveness", "measure") => {
                if let Some(v) = parse_string_value(val) {
                    config.liveness.measure = v.into();
                }
            }
            ("liveness", "serial") => {
                if let Some(v) = parse_string_value(val) {
                    config.liveness.serial = v.into();
                }
            }
            ("liveness", "interval") => {
                if let Ok(v) = val.parse() {
                    config.liveness.interval = v;
                }
            }
            ("relay", "host") => {
                if let Some(v) = parse_string_value(val) {
                    config.relay.host = v;
                }
            }
            ("relay", "port") => {
                if let Ok(v) = val.parse() {
                    config.relay.port = v;
                }
            }
            ("serial", "port") => {
                if let Some(v) = parse_string_value(val) {
                    config.serial.port = v.into();
                }
            }
            ("serial", "baud") => {
                if let Ok(v) = val.parse() {
                    config.serial.baud = v;
                }
            }
            ("decoder", "watt_scale") => {
                if let Ok(v) = val.parse() {
                    config.decoder.watt_scale = v;
                }
            }
            ("webhook", "url") => webhook_url = parse_string_value(val),
            ("webhook", "interval_min") => {
                if let Ok(v) = val.parse() {
                    webhook_interval = v;
                }
            }
            ("webhook", "stamp") => {
                if let Some(v) = parse_string_value(val) {
                    webhook_stamp = v.into();
                }
            }
            _ => {}
        }
    }

    config.webhook = webhook_url.map(|url| WebhookConfig {
        url,
        interval_min: webhook_interval,
        stamp: webhook_stamp,
    });

    config
}

/// Unquote a scalar; `null`, `~` and empty mean absent.
pub(crate) fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.port, 4444);
        assert_eq!(config.decoder.watt_scale, 1.5);
        assert_eq!(config.liveness.interval, 360);
        assert_eq!(config.serial.baud, 115_200);
        assert!(config.metrics.is_none());
        assert!(config.webhook.is_none());
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
device:
  define: "conf/device.yaml"
  cache: /var/lib/hems/dev_id.json

metrics:
  data: data/metrics.db

liveness:
  measure: /dev/shm/healthz
  serial: /dev/shm/serial.healthz
  interval: 600

relay:
  host: "relay.local"
  port: 5555

serial:
  port: /dev/ttyACM0
  baud: 9600

decoder:
  watt_scale: 1.25

webhook:
  url: "https://example.com/hook"
  interval_min: 10
"#;
        let config = parse_config(text);
        assert_eq!(config.device.define, PathBuf::from("conf/device.yaml"));
        assert_eq!(config.device.cache, PathBuf::from("/var/lib/hems/dev_id.json"));
        assert_eq!(
            config.metrics.unwrap().data,
            PathBuf::from("data/metrics.db")
        );
        assert_eq!(config.liveness.measure, PathBuf::from("/dev/shm/healthz"));
        assert_eq!(config.liveness.serial, PathBuf::from("/dev/shm/serial.healthz"));
        assert_eq!(config.liveness.interval, 600);
        assert_eq!(config.relay.host, "relay.local");
        assert_eq!(config.relay.port, 5555);
        assert_eq!(config.serial.port, PathBuf::from("/dev/ttyACM0"));
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.decoder.watt_scale, 1.25);
        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.url, "https://example.com/hook");
        assert_eq!(webhook.interval_min, 10);
    }

    #[test]
    fn test_parse_config_null_values() {
        let text = r#"
metrics:
  data: null

webhook:
  url: ~
"#;
        let config = parse_config(text);
        assert!(config.metrics.is_none());
        assert!(config.webhook.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.relay.host, "localhost");
    }

    #[test]
    fn test_parse_string_value() {
        assert_eq!(parse_string_value("\"a b\""), Some("a b".into()));
        assert_eq!(parse_string_value("'x'"), Some("x".into()));
        assert_eq!(parse_string_value("\""), Some("\"".into()));
        assert_eq!(parse_string_value("~"), None);
    }
}
