//! SQLite reliability store: heartbeats, communication errors, and daily
//! availability summaries.
//!
//! Every mutation is a single statement committed immediately, so a crash
//! never leaves half of a logical record behind.

use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use tracing::{debug, error, info};

use hems_core::slot::{
    failed_range, histogram_bin, lookback_window, open_window, seconds_into_slot, slot_start,
    target_slot, time_slot, Availability, HISTOGRAM_BINS, SLOTS_PER_DAY,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sensor_heartbeats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    time_slot INTEGER NOT NULL,
    UNIQUE(sensor_name, time_slot)
);

CREATE TABLE IF NOT EXISTS communication_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    time_slot INTEGER NOT NULL,
    error_type TEXT NOT NULL DEFAULT 'consecutive_failure',
    UNIQUE(sensor_name, time_slot)
);

CREATE TABLE IF NOT EXISTS sensor_availability (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor_name TEXT NOT NULL,
    date DATE NOT NULL,
    total_expected INTEGER NOT NULL,
    total_received INTEGER NOT NULL,
    availability_percent REAL NOT NULL,
    UNIQUE(sensor_name, date)
);

CREATE INDEX IF NOT EXISTS idx_sensor_timestamp ON sensor_heartbeats(sensor_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_errors_timestamp ON communication_errors(timestamp);
"#;

/// Kind recorded for retrospectively detected missed slots.
pub const CONSECUTIVE_FAILURE: &str = "consecutive_failure";

/// Current Unix time in seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommunicationErrorRow {
    pub sensor_name: String,
    pub timestamp: i64,
    pub time_slot: i64,
    pub error_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilitySummaryRow {
    pub sensor_name: String,
    pub date: String,
    pub total_expected: i64,
    pub total_received: i64,
    pub availability_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStat {
    pub name: String,
    pub availability_total: f64,
    pub availability_24h: f64,
    /// UTC `%Y-%m-%d %H:%M:%S` of the latest heartbeat.
    pub last_received: Option<String>,
}

/// Communication errors per 30-minute bin of the local day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorHistogram {
    pub bins: Vec<u64>,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Per-sensor heartbeat and outage bookkeeping.
pub struct ReliabilityTracker {
    conn: Connection,
}

impl ReliabilityTracker {
    /// Open or create the store at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(ReliabilityTracker { conn })
    }

    /// Open in-memory store (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    /// Record that `sensor` reported at `timestamp`. Returns the slot used.
    ///
    /// Re-recording an occupied (sensor, slot) only refreshes its timestamp.
    /// Gap detection runs afterwards and never fails this call.
    pub fn record_heartbeat(
        &mut self,
        sensor: &str,
        timestamp: i64,
        grace_seconds: i64,
    ) -> SqlResult<i64> {
        let result = self.upsert_heartbeat(sensor, timestamp, grace_seconds);
        let target = match result {
            Ok(slot) => slot,
            Err(e) => {
                error!(sensor, timestamp, "Failed to record heartbeat: {e}");
                return Err(e);
            }
        };

        debug!(
            sensor,
            slot = target,
            timestamp,
            seconds_into_slot = seconds_into_slot(timestamp),
            "Recorded heartbeat"
        );

        if let Err(e) = self.detect_gaps(sensor, target) {
            error!(sensor, slot = target, "Failed to detect communication errors: {e}");
        }

        Ok(target)
    }

    fn upsert_heartbeat(&mut self, sensor: &str, timestamp: i64, grace: i64) -> SqlResult<i64> {
        let mut lookup_err = None;
        let target = target_slot(timestamp, grace, |previous| {
            match self.has_heartbeat(sensor, previous) {
                Ok(taken) => taken,
                Err(e) => {
                    lookup_err = Some(e);
                    true
                }
            }
        });
        if let Some(e) = lookup_err {
            return Err(e);
        }
        if target != time_slot(timestamp) {
            debug!(sensor, slot = target, "Using previous slot (boundary grace applied)");
        }

        self.conn.execute(
            "INSERT INTO sensor_heartbeats (sensor_name, timestamp, time_slot)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(sensor_name, time_slot) DO UPDATE SET timestamp = excluded.timestamp",
            params![sensor, timestamp, target],
        )?;
        Ok(target)
    }

    /// Record communication errors for the slots missed before `slot`.
    ///
    /// Only gaps bounded by a heartbeat within the lookback window are
    /// attributed; a longer outage stays unrecorded. Returns rows inserted.
    pub fn detect_gaps(&mut self, sensor: &str, slot: i64) -> SqlResult<usize> {
        let window = lookback_window(slot);
        let last_ok: Option<i64> = self.conn.query_row(
            "SELECT MAX(time_slot) FROM sensor_heartbeats
             WHERE sensor_name = ?1 AND time_slot >= ?2 AND time_slot <= ?3",
            params![sensor, window.start(), window.end()],
            |r| r.get(0),
        )?;

        let Some(range) = failed_range(slot, last_ok) else {
            return Ok(0);
        };

        let mut inserted = 0;
        for missed in range {
            inserted += self.conn.execute(
                "INSERT OR IGNORE INTO communication_errors
                 (sensor_name, timestamp, time_slot, error_type)
                 VALUES (?1, ?2, ?3, ?4)",
                params![sensor, slot_start(missed), missed, CONSECUTIVE_FAILURE],
            )?;
        }

        if inserted > 0 {
            info!(sensor, slot, inserted, "Detected communication errors");
        }
        Ok(inserted)
    }

    pub fn has_heartbeat(&self, sensor: &str, slot: i64) -> SqlResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sensor_heartbeats WHERE sensor_name = ?1 AND time_slot = ?2",
            params![sensor, slot],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Latest heartbeat timestamp for a sensor.
    pub fn latest_heartbeat(&self, sensor: &str) -> SqlResult<Option<i64>> {
        self.conn.query_row(
            "SELECT MAX(timestamp) FROM sensor_heartbeats WHERE sensor_name = ?1",
            params![sensor],
            |r| r.get(0),
        )
    }

    /// Earliest heartbeat timestamp for a sensor.
    pub fn first_heartbeat(&self, sensor: &str) -> SqlResult<Option<i64>> {
        self.conn.query_row(
            "SELECT MIN(timestamp) FROM sensor_heartbeats WHERE sensor_name = ?1",
            params![sensor],
            |r| r.get(0),
        )
    }

    /// Earliest heartbeat across all sensors.
    pub fn metrics_start(&self) -> SqlResult<Option<i64>> {
        self.conn
            .query_row("SELECT MIN(timestamp) FROM sensor_heartbeats", [], |r| {
                r.get(0)
            })
    }

    /// Every sensor with at least one heartbeat, sorted by name.
    pub fn sensors(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT sensor_name FROM sensor_heartbeats ORDER BY sensor_name")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect()
    }

    pub fn count_heartbeats(&self, sensor: &str) -> i64 {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sensor_heartbeats WHERE sensor_name = ?1",
                params![sensor],
                |r| r.get(0),
            )
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    fn received_slots(&self, sensor: &str, start_slot: i64, end_slot: i64) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(DISTINCT time_slot) FROM sensor_heartbeats
             WHERE sensor_name = ?1 AND time_slot >= ?2 AND time_slot < ?3",
            params![sensor, start_slot, end_slot],
            |r| r.get(0),
        )
    }

    /// Availability over the slots `[start_slot, end_slot)`.
    pub fn availability_slots(
        &self,
        sensor: &str,
        start_slot: i64,
        end_slot: i64,
    ) -> SqlResult<Availability> {
        if end_slot <= start_slot {
            return Ok(Availability::empty());
        }
        let received = self.received_slots(sensor, start_slot, end_slot)?;
        Ok(Availability::new(end_slot - start_slot, received))
    }

    /// Availability over the timestamps `[start_ts, end_ts)`.
    pub fn availability(&self, sensor: &str, start_ts: i64, end_ts: i64) -> SqlResult<Availability> {
        self.availability_slots(sensor, time_slot(start_ts), time_slot(end_ts))
    }

    fn availability_until_now(&self, sensor: &str, start_ts: i64, now: i64) -> SqlResult<Availability> {
        let current_received = self.has_heartbeat(sensor, time_slot(now))?;
        let (start, end) = open_window(time_slot(start_ts), now, current_received);
        self.availability_slots(sensor, start, end)
    }

    /// Availability since the sensor's first heartbeat.
    pub fn availability_since_first(&self, sensor: &str, now: i64) -> SqlResult<Availability> {
        match self.first_heartbeat(sensor)? {
            Some(first) => self.availability_until_now(sensor, first, now),
            None => Ok(Availability::empty()),
        }
    }

    /// Availability over the trailing 24 hours, or since the first heartbeat
    /// if that is more recent.
    pub fn availability_24h(&self, sensor: &str, now: i64) -> SqlResult<Availability> {
        match self.first_heartbeat(sensor)? {
            Some(first) => self.availability_until_now(sensor, first.max(now - 86_400), now),
            None => Ok(Availability::empty()),
        }
    }

    /// Recompute one UTC day into `sensor_availability`.
    pub fn update_availability_summary(
        &mut self,
        sensor: &str,
        date: NaiveDate,
    ) -> SqlResult<AvailabilitySummaryRow> {
        let start_ts = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        let start_slot = time_slot(start_ts);
        let received = self.received_slots(sensor, start_slot, start_slot + SLOTS_PER_DAY)?;
        let availability = Availability::new(SLOTS_PER_DAY, received);

        let row = AvailabilitySummaryRow {
            sensor_name: sensor.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            total_expected: availability.expected,
            total_received: availability.received,
            availability_percent: availability.percent,
        };

        self.conn.execute(
            "INSERT INTO sensor_availability
             (sensor_name, date, total_expected, total_received, availability_percent)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sensor_name, date) DO UPDATE SET
                 total_expected = excluded.total_expected,
                 total_received = excluded.total_received,
                 availability_percent = excluded.availability_percent",
            params![
                row.sensor_name,
                row.date,
                row.total_expected,
                row.total_received,
                row.availability_percent
            ],
        )?;

        Ok(row)
    }

    pub fn availability_summary(
        &self,
        sensor: &str,
        date: NaiveDate,
    ) -> SqlResult<Option<AvailabilitySummaryRow>> {
        self.conn
            .query_row(
                "SELECT sensor_name, date, total_expected, total_received, availability_percent
                 FROM sensor_availability WHERE sensor_name = ?1 AND date = ?2",
                params![sensor, date.format("%Y-%m-%d").to_string()],
                |r| {
                    Ok(AvailabilitySummaryRow {
                        sensor_name: r.get(0)?,
                        date: r.get(1)?,
                        total_expected: r.get(2)?,
                        total_received: r.get(3)?,
                        availability_percent: r.get(4)?,
                    })
                },
            )
            .optional()
    }

    /// Dashboard row per sensor, in the order given.
    pub fn sensor_stats(&self, names: &[String], now: i64) -> SqlResult<Vec<SensorStat>> {
        let mut stats = Vec::with_capacity(names.len());
        for name in names {
            let last_received = self.latest_heartbeat(name)?.and_then(|ts| {
                DateTime::from_timestamp(ts, 0).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            });
            stats.push(SensorStat {
                name: name.clone(),
                availability_total: self.availability_since_first(name, now)?.percent,
                availability_24h: self.availability_24h(name, now)?.percent,
                last_received,
            });
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Communication errors
    // -----------------------------------------------------------------------

    /// Most recent communication errors, newest first.
    pub fn latest_errors(&self, limit: i64) -> SqlResult<Vec<CommunicationErrorRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT sensor_name, timestamp, time_slot, error_type
             FROM communication_errors ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |r| {
            Ok(CommunicationErrorRow {
                sensor_name: r.get(0)?,
                timestamp: r.get(1)?,
                time_slot: r.get(2)?,
                error_type: r.get(3)?,
            })
        })?;
        rows.collect()
    }

    pub fn count_errors(&self, sensor: &str) -> i64 {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM communication_errors WHERE sensor_name = ?1",
                params![sensor],
                |r| r.get(0),
            )
            .unwrap_or(0)
    }

    pub fn error_slots(&self, sensor: &str) -> SqlResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT time_slot FROM communication_errors WHERE sensor_name = ?1 ORDER BY time_slot",
        )?;
        let rows = stmt.query_map(params![sensor], |r| r.get(0))?;
        rows.collect()
    }

    /// Error histogram over the trailing `hours`, binned by local time of day.
    pub fn error_histogram(&self, hours: i64) -> SqlResult<ErrorHistogram> {
        self.error_histogram_at(hours, now(), &Local)
    }

    pub fn error_histogram_at<Tz: TimeZone>(
        &self,
        hours: i64,
        now: i64,
        tz: &Tz,
    ) -> SqlResult<ErrorHistogram> {
        let cutoff = now - hours * 3600;
        let mut stmt = self
            .conn
            .prepare("SELECT timestamp FROM communication_errors WHERE timestamp >= ?1")?;
        let timestamps = stmt
            .query_map(params![cutoff], |r| r.get::<_, i64>(0))?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut bins = vec![0u64; HISTOGRAM_BINS];
        let mut total = 0;
        for ts in timestamps {
            let Some(local) = tz.timestamp_opt(ts, 0).single() else {
                continue;
            };
            bins[histogram_bin(local.hour(), local.minute())] += 1;
            total += 1;
        }

        Ok(ErrorHistogram { bins, total })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hems_core::slot::DEFAULT_GRACE_SECONDS;

    const SENSOR: &str = "fridge";

    fn tracker() -> ReliabilityTracker {
        ReliabilityTracker::open_memory().unwrap()
    }

    /// Heartbeat comfortably inside the slot, clear of the grace window.
    fn beat(t: &mut ReliabilityTracker, sensor: &str, slot: i64) -> i64 {
        t.record_heartbeat(sensor, slot_start(slot) + 120, DEFAULT_GRACE_SECONDS)
            .unwrap()
    }

    #[test]
    fn test_record_heartbeat_slot() {
        let mut t = tracker();
        assert_eq!(beat(&mut t, SENSOR, 10), 10);
        assert!(t.has_heartbeat(SENSOR, 10).unwrap());
        assert_eq!(t.latest_heartbeat(SENSOR).unwrap(), Some(slot_start(10) + 120));
    }

    #[test]
    fn test_record_heartbeat_idempotent() {
        let mut t = tracker();
        let ts = slot_start(10) + 120;
        t.record_heartbeat(SENSOR, ts, DEFAULT_GRACE_SECONDS).unwrap();
        t.record_heartbeat(SENSOR, ts, DEFAULT_GRACE_SECONDS).unwrap();
        assert_eq!(t.count_heartbeats(SENSOR), 1);
    }

    #[test]
    fn test_grace_uses_free_previous_slot() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 8);
        let slot = t
            .record_heartbeat(SENSOR, slot_start(10) + 10, DEFAULT_GRACE_SECONDS)
            .unwrap();
        assert_eq!(slot, 9);
        assert_eq!(t.count_errors(SENSOR), 0);
    }

    #[test]
    fn test_grace_skipped_when_previous_taken() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 9);
        let slot = t
            .record_heartbeat(SENSOR, slot_start(10) + 10, DEFAULT_GRACE_SECONDS)
            .unwrap();
        assert_eq!(slot, 10);
    }

    #[test]
    fn test_repeated_grace_reading_never_duplicates_slot() {
        let mut t = tracker();
        let ts = slot_start(10) + 5;
        assert_eq!(t.record_heartbeat(SENSOR, ts, DEFAULT_GRACE_SECONDS).unwrap(), 9);
        assert_eq!(t.record_heartbeat(SENSOR, ts, DEFAULT_GRACE_SECONDS).unwrap(), 10);
        assert_eq!(t.record_heartbeat(SENSOR, ts, DEFAULT_GRACE_SECONDS).unwrap(), 10);
        assert_eq!(t.count_heartbeats(SENSOR), 2);
    }

    #[test]
    fn test_gap_and_recovery() {
        let mut t = tracker();
        for slot in [10, 11, 12] {
            beat(&mut t, SENSOR, slot);
        }
        assert_eq!(t.count_errors(SENSOR), 0);

        beat(&mut t, SENSOR, 17);
        assert_eq!(t.error_slots(SENSOR).unwrap(), vec![13, 14, 15, 16]);

        let errors = t.latest_errors(10).unwrap();
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].time_slot, 16);
        assert_eq!(errors[0].timestamp, slot_start(16));
        assert_eq!(errors[0].error_type, CONSECUTIVE_FAILURE);
    }

    #[test]
    fn test_long_gap_unattributed() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, SENSOR, 18);
        assert_eq!(t.count_errors(SENSOR), 0);
    }

    #[test]
    fn test_gap_at_lookback_edge() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, SENSOR, 15);
        assert_eq!(t.error_slots(SENSOR).unwrap(), vec![11, 12, 13, 14]);
    }

    #[test]
    fn test_gap_detection_idempotent() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, SENSOR, 13);
        beat(&mut t, SENSOR, 13);
        assert_eq!(t.error_slots(SENSOR).unwrap(), vec![11, 12]);
        assert_eq!(t.detect_gaps(SENSOR, 13).unwrap(), 0);
    }

    #[test]
    fn test_late_fill_does_not_duplicate_errors() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, SENSOR, 14);
        // A late reading fills slot 12; its own lookback sees slot 10.
        beat(&mut t, SENSOR, 12);
        assert_eq!(t.error_slots(SENSOR).unwrap(), vec![11, 12, 13]);
    }

    #[test]
    fn test_errors_are_per_sensor() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, "washer", 11);
        beat(&mut t, SENSOR, 13);
        assert_eq!(t.count_errors(SENSOR), 2);
        assert_eq!(t.count_errors("washer"), 0);
    }

    #[test]
    fn test_availability_window() {
        let mut t = tracker();
        for slot in [100, 101, 102, 104, 105, 107, 109] {
            beat(&mut t, SENSOR, slot);
        }
        let a = t.availability(SENSOR, slot_start(100), slot_start(110)).unwrap();
        assert_eq!(a.expected, 10);
        assert_eq!(a.received, 7);
        assert_eq!(a.percent, 70.0);
    }

    #[test]
    fn test_availability_zero_width() {
        let t = tracker();
        let a = t.availability(SENSOR, slot_start(10), slot_start(10)).unwrap();
        assert_eq!(a.expected, 0);
        assert_eq!(a.percent, 0.0);

        let reversed = t.availability(SENSOR, slot_start(20), slot_start(10)).unwrap();
        assert_eq!(reversed.percent, 0.0);
    }

    #[test]
    fn test_availability_since_first_includes_received_current_slot() {
        let mut t = tracker();
        for slot in [100, 101, 103] {
            beat(&mut t, SENSOR, slot);
        }
        let now = slot_start(103) + 200;
        let a = t.availability_since_first(SENSOR, now).unwrap();
        assert_eq!(a.expected, 4);
        assert_eq!(a.received, 3);
        assert_eq!(a.percent, 75.0);
    }

    #[test]
    fn test_availability_since_first_excludes_open_current_slot() {
        let mut t = tracker();
        for slot in [100, 101, 102] {
            beat(&mut t, SENSOR, slot);
        }
        let now = slot_start(103) + 200;
        let a = t.availability_since_first(SENSOR, now).unwrap();
        assert_eq!(a.expected, 3);
        assert_eq!(a.percent, 100.0);
    }

    #[test]
    fn test_availability_without_data() {
        let t = tracker();
        assert_eq!(t.availability_since_first(SENSOR, 1_000_000).unwrap().percent, 0.0);
        assert_eq!(t.availability_24h(SENSOR, 1_000_000).unwrap().percent, 0.0);
    }

    #[test]
    fn test_availability_24h_window() {
        let mut t = tracker();
        let now = slot_start(10_000) + 200;
        // One heartbeat long before the window, then the last 240 slots half full.
        beat(&mut t, SENSOR, 1_000);
        for slot in (10_000 - 240..10_000).step_by(2) {
            beat(&mut t, SENSOR, slot);
        }
        let a = t.availability_24h(SENSOR, now).unwrap();
        assert_eq!(a.expected, 240);
        assert_eq!(a.received, 120);
        assert_eq!(a.percent, 50.0);
    }

    #[test]
    fn test_availability_summary() {
        let mut t = tracker();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let day_start = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        let first = time_slot(day_start);
        for slot in first..first + 60 {
            beat(&mut t, SENSOR, slot);
        }
        // Outside the day
        beat(&mut t, SENSOR, first + SLOTS_PER_DAY);

        let row = t.update_availability_summary(SENSOR, date).unwrap();
        assert_eq!(row.total_expected, 240);
        assert_eq!(row.total_received, 60);
        assert_eq!(row.availability_percent, 25.0);

        beat(&mut t, SENSOR, first + 100);
        t.update_availability_summary(SENSOR, date).unwrap();
        let stored = t.availability_summary(SENSOR, date).unwrap().unwrap();
        assert_eq!(stored.total_received, 61);
        assert_eq!(stored.date, "2024-01-02");
    }

    #[test]
    fn test_gap_detection_failure_keeps_heartbeat() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        t.conn.execute_batch("DROP TABLE communication_errors").unwrap();

        // Slots 11..=13 are missing; writing them fails and is only logged.
        let slot = t
            .record_heartbeat(SENSOR, slot_start(14) + 120, DEFAULT_GRACE_SECONDS)
            .unwrap();
        assert_eq!(slot, 14);
        assert!(t.has_heartbeat(SENSOR, 14).unwrap());
    }

    #[test]
    fn test_heartbeat_write_failure_is_error() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        t.conn.execute_batch("DROP TABLE sensor_heartbeats").unwrap();

        let result = t.record_heartbeat(SENSOR, slot_start(11) + 120, DEFAULT_GRACE_SECONDS);
        assert!(result.is_err());
    }

    #[test]
    fn test_latest_errors_order_and_limit() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 10);
        beat(&mut t, SENSOR, 14);
        beat(&mut t, "washer", 20);
        beat(&mut t, "washer", 23);

        let errors = t.latest_errors(3).unwrap();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].sensor_name, "washer");
        assert_eq!(errors[0].time_slot, 22);
        assert!(errors.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_error_histogram_bins() {
        let mut t = tracker();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        // 01:00 is slot day+10; missing 01:06 and 01:12, recovery at 01:18
        let base = time_slot(day) + 10;
        beat(&mut t, SENSOR, base);
        beat(&mut t, SENSOR, base + 3);
        // 13:00 onwards: one miss at 13:06
        let afternoon = time_slot(day) + 130;
        beat(&mut t, SENSOR, afternoon);
        beat(&mut t, SENSOR, afternoon + 2);

        let now = day + 20 * 3600;
        let hist = t.error_histogram_at(24, now, &Utc).unwrap();
        assert_eq!(hist.bins.len(), 48);
        assert_eq!(hist.total, 3);
        assert_eq!(hist.bins[2], 2); // 01:00-01:30
        assert_eq!(hist.bins[26], 1); // 13:00-13:30

        let recent = t.error_histogram_at(8, now, &Utc).unwrap();
        assert_eq!(recent.total, 1);
    }

    #[test]
    fn test_sensor_stats() {
        let mut t = tracker();
        beat(&mut t, SENSOR, 100);
        beat(&mut t, SENSOR, 101);
        let now = slot_start(101) + 300;

        let stats = t
            .sensor_stats(&[SENSOR.to_string(), "silent".to_string()], now)
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].availability_total, 100.0);
        assert_eq!(stats[0].availability_24h, 100.0);
        assert!(stats[0].last_received.is_some());
        assert_eq!(stats[1].availability_total, 0.0);
        assert!(stats[1].last_received.is_none());
    }

    #[test]
    fn test_metrics_start() {
        let mut t = tracker();
        assert_eq!(t.metrics_start().unwrap(), None);
        beat(&mut t, "b", 20);
        beat(&mut t, "a", 30);
        assert_eq!(t.metrics_start().unwrap(), Some(slot_start(20) + 120));
        assert_eq!(t.sensors().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.db");
        let path = path.to_str().unwrap();
        {
            let mut t = ReliabilityTracker::open(path).unwrap();
            beat(&mut t, SENSOR, 5);
        }
        let t = ReliabilityTracker::open(path).unwrap();
        assert!(t.has_heartbeat(SENSOR, 5).unwrap());
    }
}
