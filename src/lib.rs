//! Polling coordinator for SYR/Safetec water-meter controllers.
//!
//! The device exposes a small HTTP/JSON API (`/trio/get/all` plus per-key
//! endpoints). This crate polls it on a fixed interval, converts raw
//! readings into typed, unit-normalized values, and maintains a consistent
//! current-state snapshot despite partial endpoint failures:
//!
//! - bulk fetch with per-key fallback for missing required endpoints
//! - bounded retry with exponential backoff, driven by payload-level error
//!   classification (a 200 status is not trusted blindly)
//! - stale-value retention with per-key miss counting
//! - an hourly consumption tracker that survives meter resets and
//!   hour-boundary rollovers
//!
//! Entry point: build a [`poller::Poller`] from [`config::PollerSettings`],
//! call [`poller::Poller::start`], and read snapshots from the returned
//! [`poller::PollerHandle`].

pub mod catalog;
pub mod classify;
pub mod cli;
pub mod config;
pub mod delta;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod poller;
pub mod retry;
pub mod state;

pub use config::PollerSettings;
pub use error::FetchError;
pub use normalize::TelemetryValue;
pub use poller::{Poller, PollerHandle};
pub use retry::RetryPolicy;
pub use state::DeviceSnapshot;
