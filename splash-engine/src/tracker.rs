//! Return-back tracking.
//!
//! One monitor task runs per open episode. It polls the episode's [`TrackerView`], resolves the
//! episode as `RETURNED` once price is back within tolerance of the trigger reference, or as
//! `TIMEOUT` once the episode outlives its tier window. Monitors are registered by symbol in
//! the [`Supervisor`], which cancels a monitor when a newer episode supersedes it.

use crate::{
    config::EngineConfig,
    model::{RecordId, Snapshot, SplashEvent, SplashStatus},
    notify::Notifier,
    persistence::{Resolution, SplashRepository},
    store::{FinishedEpisode, StateStore, TrackerView},
};
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Allowed residual deviation for an episode at `level` (a fraction, eg/ `0.05`).
///
/// Deeper splashes are allowed proportionally more residual deviation.
pub fn tolerance(level: f64, base_tolerance: f64, tolerance_scale: f64) -> f64 {
    base_tolerance + level * tolerance_scale
}

/// How an episode ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    Returned,
    Timeout,
}

impl Outcome {
    pub fn status(&self) -> SplashStatus {
        match self {
            Outcome::Returned => SplashStatus::Returned,
            Outcome::Timeout => SplashStatus::Timeout,
        }
    }
}

/// Judge one tracker tick. `deviation` is `None` while the latest snapshot is unpriced.
pub fn judge(
    view: &TrackerView,
    deviation: Option<f64>,
    elapsed: Duration,
    tolerance: f64,
) -> Option<Outcome> {
    if elapsed > view.current_window {
        Some(Outcome::Timeout)
    } else if deviation.is_some_and(|deviation| deviation <= tolerance) {
        Some(Outcome::Returned)
    } else {
        None
    }
}

/// The episode a monitor is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub symbol: SmolStr,
    pub record_id: RecordId,
    /// Reference prices at trigger time, deviation is always measured against these.
    pub trigger_ref: Snapshot,
}

/// Resolves episodes. Shared by every monitor task.
pub struct ReturnTracker {
    config: Arc<EngineConfig>,
    store: Arc<StateStore>,
    repository: Arc<dyn SplashRepository>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for ReturnTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReturnTracker {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<StateStore>,
        repository: Arc<dyn SplashRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            repository,
            notifier,
        }
    }

    /// Poll until the bound episode resolves, goes stale, or `shutdown` fires.
    pub async fn run(&self, binding: Binding, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.tracker_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut warmup = 0;
        let mut max_deviation = 0.0_f64;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    debug!(symbol = %binding.symbol, record_id = %binding.record_id, "return tracker cancelled");
                    return;
                }
            }

            if warmup < self.config.tracker_warmup_ticks {
                warmup += 1;
                continue;
            }

            let Some(view) = self.store.tracker_view(&binding.symbol, binding.record_id) else {
                debug!(symbol = %binding.symbol, record_id = %binding.record_id, "return tracker stale, exiting");
                return;
            };

            let elapsed = Instant::now().saturating_duration_since(view.trigger_time);
            let tolerance = tolerance(
                view.level,
                self.config.base_tolerance,
                self.config.tolerance_scale,
            );
            let deviation = view.latest.max_change_from(&binding.trigger_ref);
            if let Some(deviation) = deviation {
                max_deviation = max_deviation.max(deviation);
            }

            if let Some(outcome) = judge(&view, deviation, elapsed, tolerance) {
                self.finalize(&binding, outcome, elapsed, max_deviation)
                    .await;
                return;
            }
        }
    }

    /// Resolve the bound episode with `outcome`.
    ///
    /// The state reset is claimed atomically, so of several racing callers exactly one
    /// persists and notifies. Returns whether this caller resolved the episode. Persistence
    /// failures are logged and never keep the symbol triggered.
    pub async fn finalize(
        &self,
        binding: &Binding,
        outcome: Outcome,
        elapsed: Duration,
        max_deviation: f64,
    ) -> bool {
        let Some(finished) = self.store.finish(&binding.symbol, binding.record_id) else {
            debug!(symbol = %binding.symbol, record_id = %binding.record_id, "episode already resolved");
            return false;
        };

        match outcome {
            Outcome::Returned => info!(
                symbol = %binding.symbol,
                record_id = %binding.record_id,
                return_secs = elapsed.as_secs_f64(),
                "PRICE RETURNED: {} | LEVEL: {:.0}%",
                binding.symbol,
                finished.level * 100.0,
            ),
            Outcome::Timeout => info!(
                symbol = %binding.symbol,
                record_id = %binding.record_id,
                window_secs = finished.episode.current_window.as_secs(),
                "TIMEOUT: {} exceeded window of {} min",
                binding.symbol,
                finished.episode.current_window.as_secs() / 60,
            ),
        }

        self.persist_resolution(binding.record_id, outcome, elapsed, max_deviation)
            .await;
        self.notifier
            .emit(resolution_event(binding, &finished, outcome, elapsed, max_deviation));
        true
    }

    async fn persist_resolution(
        &self,
        record_id: RecordId,
        outcome: Outcome,
        elapsed: Duration,
        max_deviation: f64,
    ) {
        if let Err(error) = self.repository.get_record(record_id).await {
            warn!(%record_id, %error, "skipping resolution write");
            return;
        }

        let resolution = Resolution {
            returned: outcome == Outcome::Returned,
            return_time: elapsed,
            max_deviation,
        };
        if let Err(error) = self
            .repository
            .update_record_resolution(record_id, resolution)
            .await
        {
            warn!(%record_id, %error, "failed to persist splash resolution");
        }
    }
}

fn resolution_event(
    binding: &Binding,
    finished: &FinishedEpisode,
    outcome: Outcome,
    elapsed: Duration,
    max_deviation: f64,
) -> SplashEvent {
    let episode = &finished.episode;
    let status = outcome.status();
    SplashEvent {
        record_id: binding.record_id,
        symbol: binding.symbol.clone(),
        direction: episode.direction,
        level: (finished.level * 100.0).round() as u32,
        window: episode.current_window,
        probability: episode.win_probability,
        ref_last: binding.trigger_ref.last_price,
        ref_fair: binding.trigger_ref.fair_price,
        last_price: finished.latest.last_price,
        fair_price: finished.latest.fair_price,
        basis_gap: finished.latest.basis_gap(),
        speed_seconds: elapsed.as_secs_f64(),
        volume: finished.latest.volume_24h,
        status,
        pinned: SplashEvent::should_pin(episode.win_probability, episode.forced_pin, status),
        return_secs: Some(elapsed.as_secs_f64()),
        max_deviation: Some(max_deviation),
        timestamp: Utc::now(),
    }
}

struct Monitor {
    record_id: RecordId,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the live monitor tasks, keyed by symbol and bound to one record id each.
pub struct Supervisor {
    tracker: Arc<ReturnTracker>,
    monitors: Arc<Mutex<FnvHashMap<SmolStr, Monitor>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("active", &self.active())
            .finish()
    }
}

impl Supervisor {
    pub fn new(tracker: Arc<ReturnTracker>) -> Self {
        Self {
            tracker,
            monitors: Arc::default(),
        }
    }

    pub fn tracker(&self) -> &Arc<ReturnTracker> {
        &self.tracker
    }

    /// Spawn the monitor for a new episode, cancelling any monitor it supersedes.
    pub fn spawn(&self, binding: Binding) {
        let mut monitors = self.monitors.lock();

        if let Some(previous) = monitors.remove(&binding.symbol) {
            debug!(
                symbol = %binding.symbol,
                superseded = %previous.record_id,
                record_id = %binding.record_id,
                "cancelling superseded return tracker"
            );
            let _ = previous.shutdown.send(());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tracker = Arc::clone(&self.tracker);
        let registry = Arc::clone(&self.monitors);
        let symbol = binding.symbol.clone();
        let record_id = binding.record_id;

        let handle = tokio::spawn(async move {
            let key = binding.symbol.clone();
            tracker.run(binding, shutdown_rx).await;

            let mut monitors = registry.lock();
            if monitors
                .get(&key)
                .is_some_and(|monitor| monitor.record_id == record_id)
            {
                monitors.remove(&key);
            }
        });

        monitors.insert(
            symbol,
            Monitor {
                record_id,
                shutdown: shutdown_tx,
                handle,
            },
        );
    }

    /// Record id the live monitor for `symbol` is bound to.
    pub fn monitored(&self, symbol: &str) -> Option<RecordId> {
        self.monitors
            .lock()
            .get(symbol)
            .filter(|monitor| !monitor.handle.is_finished())
            .map(|monitor| monitor.record_id)
    }

    pub fn active(&self) -> usize {
        self.monitors
            .lock()
            .values()
            .filter(|monitor| !monitor.handle.is_finished())
            .count()
    }

    /// Cancel every monitor and wait for them to exit.
    pub async fn shutdown(&self) {
        let monitors = std::mem::take(&mut *self.monitors.lock());
        info!(monitors = monitors.len(), "shutting down return trackers");

        let handles = monitors
            .into_values()
            .map(|monitor| {
                let _ = monitor.shutdown.send(());
                monitor.handle
            })
            .collect::<Vec<_>>();

        for result in futures::future::join_all(handles).await {
            if let Err(error) = result {
                warn!(%error, "return tracker task failed");
            }
        }
    }
}
