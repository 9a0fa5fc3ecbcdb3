//! Poller configuration: consumed from CLI flags and an optional TOML file.
//!
//! The core does not own the configuration UI; it exposes validated settings
//! plus a monotonically increasing epoch id bumped on every reconfiguration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Factory-default port of the Trio device family.
pub const DEFAULT_PORT: u16 = 5333;

/// Hard floor for the scan interval. The device's true rate-limit window is
/// undocumented; this floor plus the request budget are the tunables to
/// calibrate against a real device.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("host must not be empty")]
    MissingHost,
    #[error("invalid settings file: {0}")]
    Toml(String),
}

/// Validated poller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub host: String,
    pub port: u16,
    /// Seconds between poll cycles, floored at [`MIN_SCAN_INTERVAL`].
    pub scan_interval_seconds: u64,
    /// Request budget: concurrent fallback requests per cycle. Conservative
    /// default pending empirical calibration, see `MIN_SCAN_INTERVAL`.
    pub max_concurrent_requests: usize,
    /// Request budget: floor between cycle starts, seconds.
    pub min_interval_between_cycles_seconds: u64,
    /// Consecutive misses before a required key is marked unavailable.
    pub miss_threshold: u32,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub retry: RetryPolicy,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            scan_interval_seconds: 15,
            max_concurrent_requests: 4,
            min_interval_between_cycles_seconds: 5,
            miss_threshold: 3,
            connect_timeout_seconds: 3,
            request_timeout_seconds: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl PollerSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML settings file.
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            toml::from_str(raw).map_err(|e| SettingsError::Toml(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::MissingHost);
        }
        Ok(())
    }

    /// Effective scan interval after applying both floors.
    pub fn scan_interval(&self) -> Duration {
        let requested = Duration::from_secs(self.scan_interval_seconds);
        let cycle_floor = Duration::from_secs(self.min_interval_between_cycles_seconds);
        requested.max(cycle_floor).max(MIN_SCAN_INTERVAL)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Whether `other` points at the same physical device. An identity
    /// change invalidates the delta baseline and the per-key miss counters.
    pub fn same_device(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}
