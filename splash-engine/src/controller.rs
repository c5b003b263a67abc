//! Per-symbol trigger state machine.
//!
//! `IDLE → ACTIVE → ACTIVE(progressed)`. Resolution back to `IDLE` belongs to the return
//! tracker spawned when the episode opens.

use crate::{
    config::{EngineConfig, Tier, TierSet},
    model::{Direction, NewSplashRecord, RecordId, Snapshot, SplashEvent, SplashStatus},
    notify::Notifier,
    persistence::{LevelUpdate, SplashRepository},
    state::{Episode, TickerState},
    stats::{ContextQuery, INSUFFICIENT_SAMPLE},
    store::StateStore,
    tier::{Decision, Trigger, evaluate},
    tracker::{Binding, ReturnTracker, Supervisor},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct TriggerController {
    config: Arc<EngineConfig>,
    tiers: Arc<TierSet>,
    store: Arc<StateStore>,
    repository: Arc<dyn SplashRepository>,
    notifier: Arc<dyn Notifier>,
    supervisor: Supervisor,
}

impl std::fmt::Debug for TriggerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerController")
            .field("config", &self.config)
            .field("tiers", &self.tiers)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl TriggerController {
    pub fn new(
        config: Arc<EngineConfig>,
        tiers: Arc<TierSet>,
        store: Arc<StateStore>,
        repository: Arc<dyn SplashRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let tracker = ReturnTracker::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&repository),
            Arc::clone(&notifier),
        );

        Self {
            config,
            tiers,
            store,
            repository,
            notifier,
            supervisor: Supervisor::new(Arc::new(tracker)),
        }
    }

    pub fn tiers(&self) -> &Arc<TierSet> {
        &self.tiers
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Feed one snapshot through the window manager and the state machine.
    pub async fn on_snapshot(&self, snapshot: Snapshot, now: Instant) {
        let Some(state) = self
            .store
            .observe(&snapshot, now, self.config.window_duration)
        else {
            debug!(symbol = %snapshot.symbol, "tracking new symbol");
            return;
        };

        let tiers = self.tiers.snapshot();
        match evaluate(&tiers, &state, &snapshot) {
            Decision::None => {}
            Decision::NewTrigger(trigger) => self.activate(&snapshot, &state, trigger, now).await,
            Decision::Progression(trigger) => self.progress(&snapshot, &state, trigger, now).await,
        }
    }

    async fn activate(&self, snapshot: &Snapshot, state: &TickerState, trigger: Trigger, now: Instant) {
        let Trigger {
            tier,
            direction,
            reference,
            max_change,
        } = trigger;
        let level = tier.level_percent();
        let basis_gap = snapshot.basis_gap();
        let speed_secs = now
            .saturating_duration_since(state.last_window_update)
            .as_secs_f64();
        let win_probability = self
            .win_probability(direction, level, snapshot.volume_24h, basis_gap, tier.window)
            .await;

        let record = NewSplashRecord {
            symbol: snapshot.symbol.clone(),
            direction,
            trigger_level: level,
            ref_last_price: reference.last_price,
            ref_fair_price: reference.fair_price,
            trigger_last_price: snapshot.last_price,
            trigger_fair_price: snapshot.fair_price,
            trigger_time: Utc::now(),
            volume_24h: snapshot.volume_24h,
            basis_gap,
            speed_secs,
            window: tier.window,
            win_probability,
        };

        // Never track an episode without a record, the next qualifying tick retries
        let record_id = match self.repository.save_record(record).await {
            Ok(record_id) => record_id,
            Err(error) => {
                warn!(symbol = %snapshot.symbol, %error, "failed to save splash record, activation aborted");
                return;
            }
        };

        let episode = Episode {
            record_id,
            direction,
            trigger_time: now,
            current_window: tier.window,
            trigger_ref: reference.clone(),
            win_probability,
            forced_pin: tier.is_forced_pin,
        };
        if !self
            .store
            .activate(&snapshot.symbol, episode, f64::from(level) / 100.0)
        {
            warn!(symbol = %snapshot.symbol, %record_id, "episode already open, splash record left unresolved");
            return;
        }

        let direction_win_rate = self.direction_win_rate(direction).await;
        info!(
            symbol = %snapshot.symbol,
            %record_id,
            %direction,
            level,
            max_change,
            win_probability,
            direction_win_rate,
            "SPLASH ALERT [{}] {} {}%",
            snapshot.symbol,
            direction,
            level,
        );

        self.emit_active(
            record_id,
            snapshot,
            &reference,
            direction,
            &tier,
            win_probability,
            speed_secs,
        );

        self.supervisor.spawn(Binding {
            symbol: snapshot.symbol.clone(),
            record_id,
            trigger_ref: reference,
        });
    }

    async fn progress(&self, snapshot: &Snapshot, state: &TickerState, trigger: Trigger, now: Instant) {
        let Some(episode) = state.episode.as_ref() else {
            return;
        };
        let Trigger {
            tier,
            direction,
            reference,
            ..
        } = trigger;
        let level = tier.level_percent();
        let basis_gap = snapshot.basis_gap();
        let speed_secs = now
            .saturating_duration_since(episode.trigger_time)
            .as_secs_f64();
        let win_probability = self
            .win_probability(direction, level, snapshot.volume_24h, basis_gap, tier.window)
            .await;

        let update = LevelUpdate {
            level,
            last_price: snapshot.last_price,
            fair_price: snapshot.fair_price,
            volume_24h: snapshot.volume_24h,
            win_probability,
            window: tier.window,
        };
        // A resolved record keeps the level it resolved at
        if !self.store.progress(
            &snapshot.symbol,
            episode.record_id,
            f64::from(level) / 100.0,
            tier.window,
            win_probability,
            tier.is_forced_pin,
        ) {
            debug!(symbol = %snapshot.symbol, record_id = %episode.record_id, "episode resolved before progression applied");
            return;
        }

        if let Err(error) = self
            .repository
            .update_record_level(episode.record_id, update)
            .await
        {
            warn!(symbol = %snapshot.symbol, record_id = %episode.record_id, %error, "failed to persist splash progression");
        }

        info!(
            symbol = %snapshot.symbol,
            record_id = %episode.record_id,
            %direction,
            level,
            win_probability,
            "SPLASH PROGRESSION [{}] {} {}%",
            snapshot.symbol,
            direction,
            level,
        );

        self.emit_active(
            episode.record_id,
            snapshot,
            &reference,
            direction,
            &tier,
            win_probability,
            speed_secs,
        );
    }

    /// Contextual win rate for an episode, [`INSUFFICIENT_SAMPLE`] if unavailable.
    async fn win_probability(
        &self,
        direction: Direction,
        level: u32,
        volume_24h: f64,
        basis_gap: f64,
        window: Duration,
    ) -> f64 {
        let query = ContextQuery::new(&self.config, direction, level, volume_24h, basis_gap, window);
        match self.repository.context_stats(&query).await {
            Ok(stats) => stats.win_probability(self.config.min_sample),
            Err(error) => {
                warn!(%error, "context stats unavailable");
                INSUFFICIENT_SAMPLE
            }
        }
    }

    /// Win rate of every mature episode in `direction`, logged alongside each alert.
    async fn direction_win_rate(&self, direction: Direction) -> f64 {
        match self.repository.direction_stats(direction).await {
            Ok(stats) => stats.win_probability(self.config.min_sample),
            Err(error) => {
                warn!(%error, %direction, "direction stats unavailable");
                INSUFFICIENT_SAMPLE
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_active(
        &self,
        record_id: RecordId,
        snapshot: &Snapshot,
        reference: &Snapshot,
        direction: Direction,
        tier: &Tier,
        probability: f64,
        speed_seconds: f64,
    ) {
        self.notifier.emit(SplashEvent {
            record_id,
            symbol: snapshot.symbol.clone(),
            direction,
            level: tier.level_percent(),
            window: tier.window,
            probability,
            ref_last: reference.last_price,
            ref_fair: reference.fair_price,
            last_price: snapshot.last_price,
            fair_price: snapshot.fair_price,
            basis_gap: snapshot.basis_gap(),
            speed_seconds,
            volume: snapshot.volume_24h,
            status: SplashStatus::Active,
            pinned: SplashEvent::should_pin(probability, tier.is_forced_pin, SplashStatus::Active),
            return_secs: None,
            max_deviation: None,
            timestamp: Utc::now(),
        });
    }

    /// Cancel every live return tracker.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
