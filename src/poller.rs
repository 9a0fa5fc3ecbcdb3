//! Poll scheduler and coordinator context.
//!
//! One logical loop drives one fetch cycle per tick. Cycles never overlap:
//! the loop runs each cycle inline and late ticks are dropped, not queued
//! (counted in [`PollerStats::dropped_ticks`]). The state cache and the
//! hourly delta tracker are owned by the loop: single writer, no hidden
//! globals. Downstream consumers read fully-merged snapshots through a
//! watch channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::{PollerSettings, SettingsError};
use crate::delta::HourlyDeltaTracker;
use crate::error::FetchError;
use crate::fetch::{DeviceClient, Fetcher, Transport};
use crate::normalize::{self, TelemetryValue};
use crate::state::{CycleUpdate, DeviceSnapshot, StateCache};

/// Builds a transport for the given configuration. Production binds a
/// reqwest client to `host:port`; tests inject an in-memory transport
/// through this seam.
pub type TransportFactory = Arc<dyn Fn(&PollerSettings) -> Arc<dyn Transport> + Send + Sync>;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors surfaced by [`PollerHandle`] operations.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("poller task is not running")]
    NotRunning,
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Diagnostic counters, readable while the poller runs.
#[derive(Debug, Default)]
pub struct PollerStats {
    pub cycles_completed: AtomicU64,
    /// Cycles that ended with a cycle-level failure diagnostic.
    pub cycles_degraded: AtomicU64,
    /// Cycles cancelled by reconfiguration or shutdown after the drain
    /// timeout expired.
    pub cycles_cancelled: AtomicU64,
    /// Ticks that fired while a cycle was still running.
    pub dropped_ticks: AtomicU64,
    /// Individual per-key fallback fetches issued.
    pub fallback_fetches: AtomicU64,
    pub reconfigurations: AtomicU64,
}

enum Command {
    Reconfigure(PollerSettings, oneshot::Sender<u64>),
    Shutdown(oneshot::Sender<()>),
}

enum Flow {
    Continue,
    Reschedule,
    Stop,
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Coordinator for one polled device. Construct, then [`start`](Self::start).
pub struct Poller {
    settings: PollerSettings,
    transport_factory: TransportFactory,
    drain_timeout: Duration,
}

impl Poller {
    pub fn new(settings: PollerSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            settings,
            transport_factory: default_transport_factory(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Replace the transport seam (used by tests).
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Bound on how long reconfiguration/shutdown waits for an in-flight
    /// cycle before cancelling it.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Spawn the scheduler loop and return its handle.
    pub fn start(self) -> PollerHandle {
        let stats = Arc::new(PollerStats::default());
        let cache = StateCache::new(self.settings.miss_threshold, 0);
        let (snapshot_tx, snapshot_rx) = watch::channel(cache.snapshot());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let runner = Runner {
            fetcher: Arc::new(build_fetcher(&self.transport_factory, &self.settings)),
            settings: self.settings,
            transport_factory: self.transport_factory,
            drain_timeout: self.drain_timeout,
            epoch: 0,
            cache,
            tracker: HourlyDeltaTracker::new(),
            stats: Arc::clone(&stats),
            snapshot_tx,
        };
        let task = tokio::spawn(runner.run(cmd_rx));

        PollerHandle {
            cmd_tx,
            snapshot_rx,
            stats,
            task,
        }
    }
}

/// Handle to a running poller: snapshot access, reconfiguration, shutdown.
pub struct PollerHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Arc<DeviceSnapshot>>,
    stats: Arc<PollerStats>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// The most recently published snapshot (copy-on-publish, immutable).
    pub fn current_snapshot(&self) -> Arc<DeviceSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DeviceSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Apply a new configuration. Returns the new configuration epoch once
    /// the scheduler has reconciled (timer cancelled, in-flight cycle
    /// drained or cancelled, fetchers rebuilt, rescheduled).
    pub async fn reconfigure(&self, settings: PollerSettings) -> Result<u64, PollerError> {
        settings.validate()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconfigure(settings, ack_tx))
            .await
            .map_err(|_| PollerError::NotRunning)?;
        ack_rx.await.map_err(|_| PollerError::NotRunning)
    }

    /// Stop the scheduler, cancelling any in-flight cycle after the drain
    /// timeout.
    pub async fn shutdown(self) -> Result<(), PollerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(ack_tx))
            .await
            .map_err(|_| PollerError::NotRunning)?;
        ack_rx.await.map_err(|_| PollerError::NotRunning)?;
        let _ = self.task.await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

struct Runner {
    settings: PollerSettings,
    transport_factory: TransportFactory,
    drain_timeout: Duration,
    epoch: u64,
    fetcher: Arc<Fetcher>,
    cache: StateCache,
    tracker: HourlyDeltaTracker,
    stats: Arc<PollerStats>,
    snapshot_tx: watch::Sender<Arc<DeviceSnapshot>>,
}

impl Runner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.settings.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            host = %self.settings.host,
            port = self.settings.port,
            interval_s = self.settings.scan_interval().as_secs(),
            "poller started"
        );

        loop {
            let flow = tokio::select! {
                _ = ticker.tick() => {
                    let started = tokio::time::Instant::now();
                    let cycle = run_cycle(
                        Arc::clone(&self.fetcher),
                        self.cycle_deadline(),
                        Arc::clone(&self.stats),
                    );
                    tokio::pin!(cycle);

                    let flow = tokio::select! {
                        update = &mut cycle => {
                            self.finish_cycle(update);
                            Flow::Continue
                        }
                        cmd = cmd_rx.recv() => {
                            // A command arrived mid-cycle: allow a bounded
                            // drain, then cancel the in-flight requests. A
                            // cancelled cycle mutates neither the cache nor
                            // the delta tracker.
                            match tokio::time::timeout(self.drain_timeout, &mut cycle).await {
                                Ok(update) => self.finish_cycle(update),
                                Err(_) => {
                                    self.stats.cycles_cancelled.fetch_add(1, Ordering::Relaxed);
                                    debug!("cancelled in-flight cycle");
                                }
                            }
                            self.handle_command(cmd)
                        }
                    };

                    if matches!(flow, Flow::Continue) {
                        self.account_overrun(started.elapsed());
                    }
                    flow
                }
                cmd = cmd_rx.recv() => self.handle_command(cmd),
            };

            match flow {
                Flow::Continue => {}
                Flow::Reschedule => {
                    // Cancel the pending timer and reschedule with the new
                    // interval; the next cycle runs one full interval out.
                    let interval = self.settings.scan_interval();
                    ticker = tokio::time::interval_at(
                        tokio::time::Instant::now() + interval,
                        interval,
                    );
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
                Flow::Stop => break,
            }
        }
        info!("poller stopped");
    }

    fn handle_command(&mut self, cmd: Option<Command>) -> Flow {
        match cmd {
            Some(Command::Reconfigure(settings, ack)) => {
                let epoch = self.apply_reconfigure(settings);
                let _ = ack.send(epoch);
                Flow::Reschedule
            }
            Some(Command::Shutdown(ack)) => {
                let _ = ack.send(());
                Flow::Stop
            }
            // All handles dropped: nothing can reach us any more.
            None => Flow::Stop,
        }
    }

    fn apply_reconfigure(&mut self, settings: PollerSettings) -> u64 {
        self.epoch += 1;
        let identity_changed = !self.settings.same_device(&settings);

        self.fetcher = Arc::new(build_fetcher(&self.transport_factory, &settings));
        if identity_changed {
            // New device identity: the delta baseline and the per-key miss
            // counters belong to the old meter.
            self.tracker.reset();
            self.cache.reset_counters();
            info!(host = %settings.host, port = settings.port, "rebound to new device");
        } else {
            debug!(
                interval_s = settings.scan_interval().as_secs(),
                "settings updated, cache state preserved"
            );
        }

        self.settings = settings;
        self.cache.set_epoch(self.epoch);
        self.snapshot_tx.send_replace(self.cache.snapshot());
        self.stats.reconfigurations.fetch_add(1, Ordering::Relaxed);
        self.epoch
    }

    fn finish_cycle(&mut self, mut update: CycleUpdate) {
        if let Some(total) = update.values.get("vol").and_then(TelemetryValue::as_number) {
            let delta = self.tracker.update(total, update.observed_at);
            update.hourly_consumption = Some(delta.delta);
            update.meter_reset = delta.meter_reset;
        }

        self.stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
        if update.failure.is_some() {
            self.stats.cycles_degraded.fetch_add(1, Ordering::Relaxed);
        }

        let fresh = update.values.len();
        let snapshot = self.cache.merge(update);
        debug!(
            cycle = snapshot.cycle,
            fresh_values = fresh,
            used_fallback = snapshot.used_fallback,
            "published snapshot"
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Per-cycle deadline. Longer than the scan interval so a slow cycle is
    /// given a chance to finish; ticks it overruns are dropped, not queued.
    fn cycle_deadline(&self) -> Duration {
        self.settings.scan_interval() * 2
    }

    fn account_overrun(&self, elapsed: Duration) {
        let interval = self.settings.scan_interval();
        if elapsed > interval {
            let dropped = (elapsed.as_millis() / interval.as_millis().max(1)) as u64;
            self.stats.dropped_ticks.fetch_add(dropped, Ordering::Relaxed);
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                dropped, "cycle overran the scan interval, dropping ticks"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// One fetch cycle
// ---------------------------------------------------------------------------

/// Run one complete fetch cycle under a per-cycle deadline. Always yields a
/// `CycleUpdate`: total unreachability becomes a degraded update, never a
/// panic or an error escaping the scheduler.
async fn run_cycle(fetcher: Arc<Fetcher>, deadline: Duration, stats: Arc<PollerStats>) -> CycleUpdate {
    let mut update = CycleUpdate::new(Utc::now());
    if tokio::time::timeout(deadline, cycle_body(&fetcher, &mut update, &stats))
        .await
        .is_err()
    {
        warn!(deadline_ms = deadline.as_millis() as u64, "cycle deadline exceeded");
        if update.values.is_empty() {
            update.failure = Some(FetchError::Timeout {
                url: "poll cycle".to_string(),
            });
        }
    }
    update
}

async fn cycle_body(fetcher: &Fetcher, update: &mut CycleUpdate, stats: &PollerStats) {
    fetcher.keepalive().await;

    let missing: Vec<&'static str> = match fetcher.fetch_bulk().await {
        Ok(outcome) => {
            decode_into(update, outcome.readings);
            update.unsupported = outcome.unsupported;
            outcome.missing_required
        }
        Err(err) => {
            warn!(error = %err, "bulk fetch failed, falling back to per-key requests");
            update.failure = Some(err);
            catalog::required_keys().collect()
        }
    };

    if !missing.is_empty() {
        update.used_fallback = true;
        stats
            .fallback_fetches
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        let mut last_error: Option<FetchError> = None;
        for (key, result) in fetcher.fetch_fallback(&missing).await {
            match result {
                Ok(raw) => decode_one(update, key, raw),
                Err(FetchError::Unsupported { .. }) => {
                    update.unsupported.insert(key);
                }
                Err(err) => {
                    warn!(key, error = %err, "fallback fetch failed");
                    last_error = Some(err);
                }
            }
        }

        // Cycle-wide failure only when every path came back empty; partial
        // results degrade gracefully through per-key miss counts.
        if update.values.is_empty() {
            update.failure = update.failure.take().or(last_error);
        } else {
            update.failure = None;
        }
    }
}

fn decode_into(update: &mut CycleUpdate, readings: std::collections::HashMap<&'static str, Value>) {
    for (key, raw) in readings {
        decode_one(update, key, raw);
    }
}

fn decode_one(update: &mut CycleUpdate, key: &'static str, raw: Value) {
    let Some(descriptor) = catalog::describe(key) else {
        return;
    };
    match normalize::normalize(&raw, descriptor) {
        Ok(value) => {
            update.values.insert(key, value);
        }
        Err(err) => warn!(key, error = %err, "dropping undecodable reading"),
    }
}

fn build_fetcher(factory: &TransportFactory, settings: &PollerSettings) -> Fetcher {
    Fetcher::new(
        factory(settings),
        settings.retry.clone(),
        settings.max_concurrent_requests,
        settings.request_timeout(),
    )
}

fn default_transport_factory() -> TransportFactory {
    Arc::new(|settings: &PollerSettings| {
        Arc::new(DeviceClient::new(
            &settings.host,
            settings.port,
            settings.connect_timeout(),
            settings.request_timeout(),
        )) as Arc<dyn Transport>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poller_rejects_empty_host() {
        assert!(Poller::new(PollerSettings::default()).is_err());
    }

    #[test]
    fn poller_accepts_valid_settings() {
        assert!(Poller::new(PollerSettings::new("192.168.1.81")).is_ok());
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = PollerStats::default();
        assert_eq!(stats.cycles_completed.load(Ordering::Relaxed), 0);
        assert_eq!(stats.dropped_ticks.load(Ordering::Relaxed), 0);
        assert_eq!(stats.reconfigurations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn default_factory_builds_a_transport() {
        let factory = default_transport_factory();
        // Smoke test: construction must not panic and must bind the host.
        let _transport = factory(&PollerSettings::new("192.168.1.81"));
    }
}
