//! Slot arithmetic for the reliability tracker.
//!
//! Pure logic, no database. A slot is a 360-second bucket aligned to the
//! Unix epoch, matching the meters' fixed 6-minute report cadence.

use std::ops::RangeInclusive;

use serde::Serialize;

use crate::types::round2;

/// Seconds per report slot.
pub const SLOT_SECONDS: i64 = 360;

/// Slots per UTC calendar day.
pub const SLOTS_PER_DAY: i64 = 86_400 / SLOT_SECONDS;

/// How far back gap detection looks for the last good slot.
pub const LOOKBACK_SLOTS: i64 = 5;

/// Seconds after a slot boundary during which a reading may still belong
/// to the previous slot.
pub const DEFAULT_GRACE_SECONDS: i64 = 30;

/// Histogram bins over one local day.
pub const HISTOGRAM_BINS: usize = 48;

/// Minutes covered by each histogram bin.
pub const BIN_MINUTES: u32 = 30;

pub fn time_slot(timestamp: i64) -> i64 {
    timestamp.div_euclid(SLOT_SECONDS)
}

pub fn slot_start(slot: i64) -> i64 {
    slot * SLOT_SECONDS
}

pub fn seconds_into_slot(timestamp: i64) -> i64 {
    timestamp - slot_start(time_slot(timestamp))
}

/// Slot a heartbeat at `timestamp` is recorded in.
///
/// A reading within `grace_seconds` after a boundary goes to the previous
/// slot when that slot has no heartbeat yet, absorbing jitter that pushes
/// an on-time report just past the boundary. `previous_taken` is only
/// asked about the previous slot.
pub fn target_slot(
    timestamp: i64,
    grace_seconds: i64,
    previous_taken: impl FnOnce(i64) -> bool,
) -> i64 {
    let slot = time_slot(timestamp);
    if seconds_into_slot(timestamp) <= grace_seconds && slot > 0 && !previous_taken(slot - 1) {
        slot - 1
    } else {
        slot
    }
}

/// Slots searched for the last good heartbeat before `slot`.
pub fn lookback_window(slot: i64) -> RangeInclusive<i64> {
    (slot - LOOKBACK_SLOTS)..=(slot - 1)
}

/// Slots to record as communication errors after a heartbeat at `slot`.
///
/// `last_ok` is the latest heartbeat slot inside the lookback window. With
/// none there, the outage is longer than the window (or a cold start) and
/// nothing is attributed. The returned range may be empty.
pub fn failed_range(slot: i64, last_ok: Option<i64>) -> Option<RangeInclusive<i64>> {
    let last_ok = last_ok?;
    if !lookback_window(slot).contains(&last_ok) {
        return None;
    }
    Some((last_ok + 1)..=(slot - 1))
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Received versus expected slots over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Availability {
    pub expected: i64,
    pub received: i64,
    pub percent: f64,
}

impl Availability {
    pub fn new(expected: i64, received: i64) -> Self {
        let expected = expected.max(0);
        let percent = if expected > 0 {
            round2(received as f64 / expected as f64 * 100.0)
        } else {
            0.0
        };
        Availability {
            expected,
            received,
            percent,
        }
    }

    pub fn empty() -> Self {
        Availability::new(0, 0)
    }
}

/// Slot bounds `[start, end)` of a window that ends now.
///
/// The still-open current slot only counts once it has a heartbeat;
/// before that it is left out of the denominator entirely.
pub fn open_window(start_slot: i64, now: i64, current_received: bool) -> (i64, i64) {
    let current = time_slot(now);
    let end = if current_received { current + 1 } else { current };
    (start_slot, end)
}

/// Histogram bin for a local time of day.
pub fn histogram_bin(hour: u32, minute: u32) -> usize {
    (((hour * 60 + minute) / BIN_MINUTES) as usize).min(HISTOGRAM_BINS - 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_slot() {
        assert_eq!(time_slot(0), 0);
        assert_eq!(time_slot(359), 0);
        assert_eq!(time_slot(360), 1);
        assert_eq!(time_slot(3600), 10);
    }

    #[test]
    fn test_time_slot_monotonic() {
        let mut prev = time_slot(0);
        for t in (0..100_000).step_by(7) {
            let s = time_slot(t);
            assert!(s >= prev, "slot decreased at t={t}");
            prev = s;
        }
    }

    #[test]
    fn test_slots_per_day() {
        assert_eq!(SLOTS_PER_DAY, 240);
    }

    #[test]
    fn test_target_slot_within_grace_previous_free() {
        let ts = slot_start(100) + 10;
        assert_eq!(target_slot(ts, DEFAULT_GRACE_SECONDS, |_| false), 99);
    }

    #[test]
    fn test_target_slot_within_grace_previous_taken() {
        let ts = slot_start(100) + 10;
        assert_eq!(target_slot(ts, DEFAULT_GRACE_SECONDS, |_| true), 100);
    }

    #[test]
    fn test_target_slot_grace_boundary_inclusive() {
        assert_eq!(target_slot(slot_start(100) + 30, 30, |_| false), 99);
        assert_eq!(target_slot(slot_start(100) + 31, 30, |_| false), 100);
    }

    #[test]
    fn test_target_slot_never_below_zero() {
        assert_eq!(target_slot(5, DEFAULT_GRACE_SECONDS, |_| false), 0);
    }

    #[test]
    fn test_target_slot_only_queries_previous() {
        let ts = slot_start(100) + 5;
        let slot = target_slot(ts, DEFAULT_GRACE_SECONDS, |s| {
            assert_eq!(s, 99);
            false
        });
        assert_eq!(slot, 99);
    }

    #[test]
    fn test_failed_range_gap() {
        assert_eq!(failed_range(17, Some(12)), Some(13..=16));
    }

    #[test]
    fn test_failed_range_contiguous_is_empty() {
        let range = failed_range(13, Some(12)).unwrap();
        assert!(range.is_empty());
    }

    #[test]
    fn test_failed_range_outside_lookback() {
        assert_eq!(failed_range(18, None), None);
        assert_eq!(failed_range(18, Some(10)), None);
    }

    #[test]
    fn test_lookback_window() {
        assert_eq!(lookback_window(17), 12..=16);
    }

    #[test]
    fn test_availability_percent() {
        let a = Availability::new(10, 7);
        assert_eq!(a.percent, 70.0);
        assert_eq!(Availability::new(3, 1).percent, 33.33);
    }

    #[test]
    fn test_availability_zero_window() {
        assert_eq!(Availability::new(0, 0).percent, 0.0);
        let negative = Availability::new(-4, 0);
        assert_eq!(negative.expected, 0);
        assert_eq!(negative.percent, 0.0);
    }

    #[test]
    fn test_open_window() {
        let now = slot_start(50) + 100;
        assert_eq!(open_window(40, now, true), (40, 51));
        assert_eq!(open_window(40, now, false), (40, 50));
    }

    #[test]
    fn test_histogram_bin() {
        assert_eq!(histogram_bin(0, 0), 0);
        assert_eq!(histogram_bin(0, 29), 0);
        assert_eq!(histogram_bin(0, 30), 1);
        assert_eq!(histogram_bin(13, 45), 27);
        assert_eq!(histogram_bin(23, 59), 47);
    }
}
