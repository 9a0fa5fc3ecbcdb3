//! State cache and snapshot merging.
//!
//! Exactly one merge happens per poll cycle, by exactly one writer. The
//! published snapshot always spans the full catalog: a failing endpoint is
//! marked unavailable past the miss threshold, never dropped, and its last
//! good value is retained for diagnostics. Downstream consumers only ever
//! see fully-merged, immutable snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::catalog;
use crate::error::FetchError;
use crate::normalize::TelemetryValue;

/// Per-key state within a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ValueState {
    /// Last good value. Retained even while unavailable.
    pub value: Option<TelemetryValue>,
    pub unit: &'static str,
    /// Live flag: false before first data, past the miss threshold, or for
    /// unsupported keys.
    pub available: bool,
    /// Key structurally absent from this firmware variant.
    pub unsupported: bool,
    /// Consecutive cycles this (required) key was absent from fetched data.
    pub miss_count: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ValueState {
    fn empty(unit: &'static str) -> Self {
        Self {
            value: None,
            unit,
            available: false,
            unsupported: false,
            miss_count: 0,
            last_updated: None,
        }
    }
}

/// The externally published artifact. Immutable once published; superseded
/// wholesale each cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// One entry per catalog key, no key ever omitted.
    pub values: BTreeMap<&'static str, ValueState>,
    pub cycle: u64,
    /// Configuration epoch this snapshot was produced under.
    pub epoch: u64,
    /// Timestamp of the last cycle that yielded at least one fresh value.
    pub last_success: Option<DateTime<Utc>>,
    /// Diagnostic for the most recent degraded cycle, cleared on recovery.
    pub last_error: Option<String>,
    /// Whether the per-key fallback path was used this cycle.
    pub used_fallback: bool,
    /// Consumption since the start of the current wall-clock hour, liters.
    pub hourly_consumption: Option<f64>,
    /// A meter reset (total dropped below baseline) was observed this cycle.
    pub meter_reset: bool,
}

impl DeviceSnapshot {
    fn initial(epoch: u64) -> Self {
        let values = catalog::all()
            .iter()
            .map(|d| (d.key, ValueState::empty(d.unit)))
            .collect();
        Self {
            values,
            cycle: 0,
            epoch,
            last_success: None,
            last_error: None,
            used_fallback: false,
            hourly_consumption: None,
            meter_reset: false,
        }
    }

    /// Published accessor for downstream consumers. Every catalog key has an
    /// entry; `None` means the key is not in the catalog at all.
    pub fn get_value(&self, key: &str) -> Option<&ValueState> {
        self.values.get(key)
    }
}

/// Outcome of one poll cycle, handed to [`StateCache::merge`].
#[derive(Debug)]
pub struct CycleUpdate {
    /// Freshly normalized values, possibly a subset of the catalog.
    pub values: HashMap<&'static str, TelemetryValue>,
    /// Keys this firmware reported as structurally absent.
    pub unsupported: HashSet<&'static str>,
    pub used_fallback: bool,
    /// Cycle-level failure diagnostic (e.g. all fetch paths unreachable).
    pub failure: Option<FetchError>,
    pub observed_at: DateTime<Utc>,
    pub hourly_consumption: Option<f64>,
    pub meter_reset: bool,
}

impl CycleUpdate {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            values: HashMap::new(),
            unsupported: HashSet::new(),
            used_fallback: false,
            failure: None,
            observed_at,
            hourly_consumption: None,
            meter_reset: false,
        }
    }
}

/// Single-writer cache of the current device state.
pub struct StateCache {
    current: DeviceSnapshot,
    miss_threshold: u32,
}

impl StateCache {
    pub fn new(miss_threshold: u32, epoch: u64) -> Self {
        Self {
            current: DeviceSnapshot::initial(epoch),
            miss_threshold,
        }
    }

    /// Merge one cycle's partial results into the retained state and publish
    /// a copy. For every catalog key: fresh value → replace, reset the miss
    /// count; absent required key → retain the stale value, increment the
    /// miss count, and flip availability once the threshold is reached.
    pub fn merge(&mut self, update: CycleUpdate) -> Arc<DeviceSnapshot> {
        self.current.cycle += 1;

        for descriptor in catalog::all() {
            let entry = self
                .current
                .values
                .get_mut(descriptor.key)
                .expect("snapshot spans the catalog");

            if let Some(value) = update.values.get(descriptor.key) {
                entry.value = Some(value.clone());
                entry.available = true;
                entry.unsupported = false;
                entry.miss_count = 0;
                entry.last_updated = Some(update.observed_at);
            } else if update.unsupported.contains(descriptor.key) {
                entry.available = false;
                entry.unsupported = true;
            } else if descriptor.required {
                entry.miss_count = entry.miss_count.saturating_add(1);
                if entry.miss_count >= self.miss_threshold {
                    if entry.available {
                        debug!(
                            key = descriptor.key,
                            miss_count = entry.miss_count,
                            "marking endpoint unavailable, stale value retained"
                        );
                    }
                    entry.available = false;
                }
            }
            // Optional keys absent from this cycle keep their previous state
            // untouched.
        }

        if !update.values.is_empty() {
            self.current.last_success = Some(update.observed_at);
        }
        self.current.last_error = update.failure.as_ref().map(|e| e.to_string());
        self.current.used_fallback = update.used_fallback;
        if update.hourly_consumption.is_some() {
            self.current.hourly_consumption = update.hourly_consumption;
        }
        self.current.meter_reset = update.meter_reset;

        Arc::new(self.current.clone())
    }

    /// Current state without merging (copy-on-publish).
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        Arc::new(self.current.clone())
    }

    /// Reset per-key availability and miss counters. Used when the polled
    /// device identity changes (new host/port).
    pub fn reset_counters(&mut self) {
        for entry in self.current.values.values_mut() {
            entry.available = false;
            entry.unsupported = false;
            entry.miss_count = 0;
        }
        self.current.hourly_consumption = None;
        self.current.meter_reset = false;
    }

    /// Record the configuration epoch subsequent snapshots belong to.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.current.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const THRESHOLD: u32 = 3;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 10, 15, 0).unwrap()
    }

    fn number(v: f64) -> TelemetryValue {
        TelemetryValue::Number { value: v }
    }

    fn full_update() -> CycleUpdate {
        let mut update = CycleUpdate::new(now());
        update.values.insert("vol", number(120.0));
        update.values.insert("bar", number(4.1));
        update.values.insert("cel", number(21.5));
        update.values.insert("flo", number(0.0));
        update.values.insert(
            "vlv",
            TelemetryValue::Code {
                code: "20".to_string(),
                label: Some("Open".to_string()),
            },
        );
        update
    }

    #[test]
    fn snapshot_always_spans_the_catalog() {
        let cache = StateCache::new(THRESHOLD, 0);
        let snap = cache.snapshot();
        assert_eq!(snap.values.len(), catalog::all().len());
        for key in catalog::all_keys() {
            assert!(snap.get_value(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn fresh_value_resets_miss_count_and_marks_available() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        let snap = cache.merge(full_update());
        let vol = snap.get_value("vol").unwrap();
        assert!(vol.available);
        assert_eq!(vol.miss_count, 0);
        assert_eq!(vol.value, Some(number(120.0)));
        assert_eq!(vol.last_updated, Some(now()));
    }

    #[test]
    fn missing_required_key_stays_available_below_threshold() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        cache.merge(full_update());

        // Two consecutive cycles without "bar": stale value still live.
        for _ in 0..(THRESHOLD - 1) {
            let mut update = full_update();
            update.values.remove("bar");
            let snap = cache.merge(update);
            let bar = snap.get_value("bar").unwrap();
            assert!(bar.available, "miss_count {}", bar.miss_count);
            assert_eq!(bar.value, Some(number(4.1)));
        }
    }

    #[test]
    fn missing_required_key_flips_unavailable_at_threshold() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        cache.merge(full_update());

        let mut last = cache.snapshot();
        for _ in 0..THRESHOLD {
            let mut update = full_update();
            update.values.remove("bar");
            last = cache.merge(update);
        }
        let bar = last.get_value("bar").unwrap();
        assert!(!bar.available);
        assert_eq!(bar.miss_count, THRESHOLD);
        // Last good value retained for diagnostics.
        assert_eq!(bar.value, Some(number(4.1)));
    }

    #[test]
    fn one_failing_key_never_blanks_out_siblings() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        cache.merge(full_update());

        let mut last = cache.snapshot();
        for _ in 0..(THRESHOLD + 2) {
            let mut update = full_update();
            update.values.remove("bar");
            last = cache.merge(update);
        }
        assert!(!last.get_value("bar").unwrap().available);
        assert!(last.get_value("vol").unwrap().available);
        assert!(last.get_value("cel").unwrap().available);
    }

    #[test]
    fn optional_absent_key_does_not_accumulate_misses() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        let mut update = full_update();
        update.values.insert("cnd", number(450.0));
        cache.merge(update);

        let mut last = cache.snapshot();
        for _ in 0..(THRESHOLD + 2) {
            last = cache.merge(full_update()); // no cnd
        }
        let cnd = last.get_value("cnd").unwrap();
        assert_eq!(cnd.miss_count, 0);
        assert!(cnd.available, "optional keys keep their last state");
        assert_eq!(cnd.value, Some(number(450.0)));
    }

    #[test]
    fn unsupported_key_is_not_an_error() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        let mut update = full_update();
        update.unsupported.insert("cnd");
        let snap = cache.merge(update);
        let cnd = snap.get_value("cnd").unwrap();
        assert!(cnd.unsupported);
        assert!(!cnd.available);
        assert_eq!(cnd.miss_count, 0);
    }

    #[test]
    fn degraded_cycle_retains_values_and_sets_diagnostic() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        cache.merge(full_update());

        let mut degraded = CycleUpdate::new(now());
        degraded.failure = Some(FetchError::Network {
            url: "http://device:5333/trio/get/all".to_string(),
            detail: "connection refused".to_string(),
        });
        let snap = cache.merge(degraded);

        assert!(snap.last_error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(snap.get_value("vol").unwrap().value, Some(number(120.0)));
        // A single degraded cycle does not flip availability.
        assert!(snap.get_value("vol").unwrap().available);
    }

    #[test]
    fn recovery_clears_the_cycle_diagnostic() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        let mut degraded = CycleUpdate::new(now());
        degraded.failure = Some(FetchError::Timeout {
            url: "http://device:5333/trio/get/all".to_string(),
        });
        assert!(cache.merge(degraded).last_error.is_some());
        assert!(cache.merge(full_update()).last_error.is_none());
    }

    #[test]
    fn last_success_tracks_cycles_with_fresh_values() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        assert!(cache.snapshot().last_success.is_none());
        let snap = cache.merge(full_update());
        assert_eq!(snap.last_success, Some(now()));
    }

    #[test]
    fn reset_counters_clears_availability_but_keeps_values() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        cache.merge(full_update());
        cache.reset_counters();
        let snap = cache.snapshot();
        let vol = snap.get_value("vol").unwrap();
        assert!(!vol.available);
        assert_eq!(vol.miss_count, 0);
        assert_eq!(vol.value, Some(number(120.0)));
    }

    #[test]
    fn cycle_counter_increments_per_merge() {
        let mut cache = StateCache::new(THRESHOLD, 0);
        assert_eq!(cache.merge(full_update()).cycle, 1);
        assert_eq!(cache.merge(full_update()).cycle, 2);
    }
}
