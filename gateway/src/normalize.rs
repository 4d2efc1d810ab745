//! Telemetry Normalizer & Deduper (spec.md §4.4).
//!
//! Two concerns live here because the source never separated them: coordinate
//! and scalar validation/clamping, and the bounded per-IMEI recent-records
//! window used to suppress duplicates. Both the Ruptela batch path and the
//! Jimi single-fix path run through the same dedup window — spec.md §3's
//! GpsFix invariant and §4.4's Records invariant are the same rule applied to
//! two different call sites.

use std::collections::{HashMap, VecDeque};

use crate::codec::Record;

/// Bound on the per-IMEI recent-keys window (spec.md §3 "RecentRecordsWindow").
const WINDOW_CAPACITY: usize = 100;

/// Process-wide, per-IMEI bounded set of recently emitted record fingerprints.
/// Guarded the way spec.md §5 requires for shared mutable structures: callers
/// take a lock (an outer `Mutex`/`RwLock` around this type) before touching
/// it, and no I/O ever happens while holding it.
#[derive(Debug, Default)]
pub struct RecentWindow {
    per_imei: HashMap<String, VecDeque<String>>,
}

impl RecentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `key` against the window for `imei`, then records it
    /// regardless of the outcome (duplicates still refresh the window, per
    /// spec.md §4.4 "merged into the recent-keys window"). Returns `true` if
    /// `key` was already present — the caller should suppress emission but
    /// may still ACK positively.
    pub fn check_and_record(&mut self, imei: &str, key: &str) -> bool {
        let entries = self.per_imei.entry(imei.to_string()).or_default();
        let duplicate = entries.contains(&key.to_string());
        if !duplicate {
            entries.push_back(key.to_string());
            if entries.len() > WINDOW_CAPACITY {
                entries.pop_front();
            }
        }
        duplicate
    }
}

/// Dedup key per spec.md §4.4: `timestamp || lat.toFixed(6) || lon.toFixed(6)`.
pub fn dedup_key(timestamp_secs: i64, lat: f64, lon: f64) -> String {
    format!("{timestamp_secs}|{lat:.6}|{lon:.6}")
}

/// `(0,0)`, out-of-range, axis-aligned multiples of 90/180, digit-triplet
/// repetition, and lat/lon colliding at 4 decimal places are all rejected
/// (spec.md §4.4 "Coordinate validation").
pub fn is_valid_coordinate_pair(lat: f64, lon: f64) -> bool {
    if lat == 0.0 && lon == 0.0 {
        return false;
    }
    if lat.abs() > 90.0 || lon.abs() > 180.0 {
        return false;
    }
    if lat.abs() + lon.abs() <= f64::EPSILON {
        return false;
    }

    let lat_whole = lat.trunc();
    let lon_whole = lon.trunc();
    if lat_whole % 90.0 == 0.0 && lon_whole % 180.0 == 0.0 {
        return false;
    }

    let concatenated = format!("{}{}", fixed(lat, 6), fixed(lon, 6));
    if has_triplet_repetition(&concatenated) {
        return false;
    }

    if fixed(lat, 4) == fixed(lon, 4) {
        return false;
    }

    true
}

/// spec.md §3's lighter-weight gate for a single Jimi GpsFix: bounds plus
/// "not both coordinates are (near) zero". The richer §4.4 coordinate
/// validation above is reserved for the Ruptela batch path, which is the one
/// spec.md actually names it for.
pub fn is_plausible_jimi_fix(lat: f64, lon: f64, positioned: bool) -> bool {
    positioned && lat.abs() <= 90.0 && lon.abs() <= 180.0 && (lat.abs() + lon.abs() > f64::EPSILON)
}

/// Garbage scalar detection (spec.md §4.4): platform float sentinel
/// extremes, exact powers of two, and decimal representations that collapse
/// to a single repeated digit are all rejected.
pub fn is_garbage_scalar(v: f64) -> bool {
    if v == f64::MAX || v == f64::MIN || !v.is_finite() {
        return true;
    }
    if v != 0.0 && v.abs().log2().fract() == 0.0 {
        return true;
    }
    if is_single_repeated_digit(v) {
        return true;
    }
    false
}

fn is_single_repeated_digit(v: f64) -> bool {
    let s = format!("{}", v.abs());
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 2 {
        return false;
    }
    let first = digits.chars().next().unwrap();
    first != '0' && digits.chars().all(|c| c == first)
}

fn has_triplet_repetition(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 6 {
        return false;
    }
    for i in 0..=bytes.len() - 6 {
        if bytes[i..i + 3] == bytes[i + 3..i + 6] {
            return true;
        }
    }
    false
}

fn fixed(v: f64, places: usize) -> String {
    format!("{:.*}", places, v)
}

pub fn clamp_speed(speed: f64) -> f64 {
    speed.clamp(0.0, 1000.0)
}

pub fn clamp_altitude(altitude: f64) -> f64 {
    altitude.clamp(-1000.0, 20000.0)
}

pub fn normalize_course(course: f64) -> f64 {
    let m = course.rem_euclid(360.0);
    if m < 0.0 {
        m + 360.0
    } else {
        m
    }
}

/// Filters, clamps, and sorts a Ruptela records batch (spec.md §4.4). Does
/// not touch the recent-records window — that happens per-record at the
/// fan-out call site once the caller knows which records survive.
pub fn filter_and_normalize_records(mut records: Vec<Record>) -> Vec<Record> {
    records.retain(|r| {
        is_valid_coordinate_pair(r.lat, r.lon)
            && !is_garbage_scalar(r.altitude)
            && !is_garbage_scalar(r.course)
    });

    for r in &mut records {
        r.speed = clamp_speed(r.speed as f64) as u16;
        r.altitude = clamp_altitude(r.altitude);
        r.course = normalize_course(r.course);
    }

    records.sort_by_key(|r| r.timestamp);
    records
}

/// Stationary consolidation (spec.md §4.4): when every surviving record in
/// the batch reports `speed == 0`, only the most recent is emitted.
pub fn consolidate_stationary(records: Vec<Record>) -> Vec<Record> {
    if records.len() > 1 && records.iter().all(|r| r.speed == 0) {
        let latest = records.into_iter().max_by_key(|r| r.timestamp);
        latest.into_iter().collect()
    } else {
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn record_at(ts: i64, lat: f64, lon: f64, speed: u16) -> Record {
        Record {
            timestamp: Utc.timestamp_opt(ts, 0).single().unwrap(),
            priority: 1,
            lat,
            lon,
            altitude: 100.0,
            course: 10.0,
            satellites: 8,
            speed,
            hdop: 1.0,
            event_id: 0,
            io_elements: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_null_island() {
        assert!(!is_valid_coordinate_pair(0.0, 0.0));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(!is_valid_coordinate_pair(91.0, 0.0));
        assert!(!is_valid_coordinate_pair(0.0, 181.0));
    }

    #[test]
    fn rejects_axis_aligned_multiples() {
        assert!(!is_valid_coordinate_pair(90.0, 180.0));
        assert!(!is_valid_coordinate_pair(0.0, 0.0));
    }

    #[test]
    fn accepts_ordinary_coordinates() {
        assert!(is_valid_coordinate_pair(35.6938035, -46.3000000));
    }

    #[test]
    fn garbage_scalar_rejects_power_of_two() {
        assert!(is_garbage_scalar(1024.0));
        assert!(!is_garbage_scalar(123.4));
    }

    #[test]
    fn garbage_scalar_rejects_repeated_digit() {
        assert!(is_garbage_scalar(111.0));
        assert!(is_garbage_scalar(22.0));
    }

    #[test]
    fn recent_window_suppresses_duplicate_key() {
        let mut window = RecentWindow::new();
        let key = dedup_key(1_700_000_000, 35.693803, -46.300000);
        assert!(!window.check_and_record("123", key.as_str()));
        assert!(window.check_and_record("123", key.as_str()));
    }

    #[test]
    fn recent_window_is_per_imei() {
        let mut window = RecentWindow::new();
        let key = dedup_key(1_700_000_000, 35.693803, -46.300000);
        assert!(!window.check_and_record("a", key.as_str()));
        assert!(!window.check_and_record("b", key.as_str()));
    }

    #[test]
    fn stationary_consolidation_keeps_only_latest() {
        let records = vec![
            record_at(1_700_000_000, 35.0, -46.0, 0),
            record_at(1_700_000_030, 35.0001, -46.0001, 0),
            record_at(1_700_000_060, 35.0002, -46.0002, 0),
        ];
        let out = consolidate_stationary(records);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp.timestamp(), 1_700_000_060);
    }

    #[test]
    fn mixed_speed_batch_emits_all() {
        let records = vec![
            record_at(1_700_000_000, 35.0, -46.0, 0),
            record_at(1_700_000_030, 35.0001, -46.0001, 40),
        ];
        let out = consolidate_stationary(records);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn filter_sorts_by_timestamp_ascending() {
        let records = vec![
            record_at(1_700_000_060, 35.0, -46.0, 10),
            record_at(1_700_000_000, 35.0001, -46.0001, 10),
        ];
        let out = filter_and_normalize_records(records);
        assert!(out[0].timestamp < out[1].timestamp);
    }
}
