//! Hourly consumption delta tracking.
//!
//! Derives per-hour consumption from the monotonically increasing total
//! volume counter. The baseline resets exactly once per wall-clock hour
//! boundary, independent of poll cadence, and immediately on a meter reset
//! (total dropping below the baseline). The emitted delta is never negative.

use chrono::{DateTime, Utc};
use tracing::warn;

/// Result of feeding one total-volume reading into the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaUpdate {
    /// Consumption since the current hour's baseline, liters. Never negative.
    pub delta: f64,
    /// The reading dropped below the baseline (meter reset/rollover).
    pub meter_reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TrackerState {
    Uninitialized,
    Tracking {
        baseline: f64,
        /// Hour bucket (hours since the epoch) the baseline belongs to.
        baseline_hour: i64,
        last_total: f64,
    },
}

/// Stateful per-hour consumption tracker.
///
/// Persists across ticks and reconnections within one configuration epoch;
/// a host/port change resets it to `Uninitialized` because the prior
/// baseline belongs to a different meter.
#[derive(Debug)]
pub struct HourlyDeltaTracker {
    state: TrackerState,
    /// Meter resets observed since construction, for diagnostics.
    resets_seen: u64,
}

impl Default for HourlyDeltaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HourlyDeltaTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::Uninitialized,
            resets_seen: 0,
        }
    }

    /// Feed one total-volume reading observed at `now`.
    pub fn update(&mut self, total: f64, now: DateTime<Utc>) -> DeltaUpdate {
        let hour = hour_bucket(now);

        let (baseline, baseline_hour, _) = match self.state {
            TrackerState::Uninitialized => {
                self.state = TrackerState::Tracking {
                    baseline: total,
                    baseline_hour: hour,
                    last_total: total,
                };
                return DeltaUpdate {
                    delta: 0.0,
                    meter_reset: false,
                };
            }
            TrackerState::Tracking {
                baseline,
                baseline_hour,
                last_total,
            } => (baseline, baseline_hour, last_total),
        };

        // Top-of-hour rollover: the new hour starts from the current total.
        let (mut baseline, mut baseline_hour) = (baseline, baseline_hour);
        if hour != baseline_hour {
            baseline = total;
            baseline_hour = hour;
        }

        // Meter reset: counter went backwards. Re-baseline immediately,
        // regardless of the hour boundary.
        let meter_reset = total < baseline;
        if meter_reset {
            warn!(
                total,
                baseline, "total volume dropped below baseline, treating as meter reset"
            );
            self.resets_seen += 1;
            baseline = total;
        }

        self.state = TrackerState::Tracking {
            baseline,
            baseline_hour,
            last_total: total,
        };

        DeltaUpdate {
            delta: (total - baseline).max(0.0),
            meter_reset,
        }
    }

    /// Drop all state. Called when the polled device identity changes.
    pub fn reset(&mut self) {
        self.state = TrackerState::Uninitialized;
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, TrackerState::Uninitialized)
    }

    pub fn resets_seen(&self) -> u64 {
        self.resets_seen
    }
}

fn hour_bucket(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(3600)
}
