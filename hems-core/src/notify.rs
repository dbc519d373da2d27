//! Failure notification via webhook.
//!
//! POSTs `{"text": ...}` when a daemon loop dies. A stamp file throttles
//! delivery to one message per `interval_min`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::liveness::touch;

/// Posts error reports to a chat webhook URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    interval: Duration,
    stamp: PathBuf,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, interval_min: u64, stamp: impl Into<PathBuf>) -> Self {
        WebhookNotifier {
            url: url.to_string(),
            interval: Duration::from_secs(interval_min * 60),
            stamp: stamp.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(&config.url, config.interval_min, &config.stamp)
    }

    /// True when no notification went out within the interval.
    pub fn due(&self, now: SystemTime) -> bool {
        stamp_age(&self.stamp, now).map_or(true, |age| age >= self.interval)
    }

    /// POST an error report. Returns true if a message was delivered.
    pub async fn notify_error(&self, title: &str, detail: &str) -> bool {
        if !self.due(SystemTime::now()) {
            info!("Skipping notification (sent within the last {}s)", self.interval.as_secs());
            return false;
        }

        let payload = payload(title, detail);
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Err(e) = touch(&self.stamp) {
                    warn!("Failed to update notification stamp {}: {e}", self.stamp.display());
                }
                true
            }
            Ok(resp) => {
                warn!("Webhook POST rejected: {}", resp.status());
                false
            }
            Err(e) => {
                warn!("Webhook POST failed: {e}");
                false
            }
        }
    }
}

fn payload(title: &str, detail: &str) -> serde_json::Value {
    serde_json::json!({
        "text": format!("{title}\n```\n{detail}\n```"),
    })
}

fn stamp_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(now.duration_since(modified).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_creation() {
        let wh = WebhookNotifier::new("https://example.com/hook", 10, "data/webhook.stamp");
        assert_eq!(wh.url, "https://example.com/hook");
        assert_eq!(wh.interval, Duration::from_secs(600));
    }

    #[test]
    fn test_payload_text() {
        let value = payload("hems listen failed", "metrics store: disk I/O error");
        let text = value["text"].as_str().unwrap();
        assert!(text.starts_with("hems listen failed\n"));
        assert!(text.contains("disk I/O error"));
    }

    #[test]
    fn test_due_without_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let wh = WebhookNotifier::new("https://example.com/hook", 60, dir.path().join("stamp"));
        assert!(wh.due(SystemTime::now()));
    }

    #[test]
    fn test_throttled_after_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = dir.path().join("stamp");
        touch(&stamp).unwrap();

        let wh = WebhookNotifier::new("https://example.com/hook", 60, &stamp);
        assert!(!wh.due(SystemTime::now()));
        assert!(wh.due(SystemTime::now() + Duration::from_secs(3601)));
    }

    #[tokio::test]
    async fn test_throttled_notify_skips_post() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = dir.path().join("stamp");
        touch(&stamp).unwrap();

        // Fresh stamp: no request goes out.
        let wh = WebhookNotifier::new("http://127.0.0.1:9/hook", 60, &stamp);
        assert!(!wh.notify_error("failed", "detail").await);
    }
}
