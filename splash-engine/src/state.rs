use crate::model::{Direction, RecordId, Snapshot};
use std::time::Duration;
use tokio::time::Instant;

/// Per-symbol detection state, owned by the [`StateStore`](crate::store::StateStore).
#[derive(Debug, Clone, PartialEq)]
pub struct TickerState {
    /// Reference snapshot relative changes are measured against.
    pub window_start_ref: Snapshot,
    pub latest: Snapshot,
    pub last_window_update: Instant,
    /// Highest tier threshold (as a fraction) reached in the current window or episode.
    pub last_triggered_level: f64,
    /// Open episode, if any.
    pub episode: Option<Episode>,
}

/// An open splash episode. Dropped when the episode resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub record_id: RecordId,
    /// Assigned once at activation.
    pub direction: Direction,
    pub trigger_time: Instant,
    pub current_window: Duration,
    /// Reference prices the episode was triggered against.
    pub trigger_ref: Snapshot,
    pub win_probability: f64,
    pub forced_pin: bool,
}

impl TickerState {
    pub fn new(snapshot: Snapshot, now: Instant) -> Self {
        Self {
            window_start_ref: snapshot.clone(),
            latest: snapshot,
            last_window_update: now,
            last_triggered_level: 0.0,
            episode: None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.episode.is_some()
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.episode.as_ref().map(|episode| episode.record_id)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.episode.as_ref().map(|episode| episode.direction)
    }

    /// Window manager step for a symbol that has been seen before.
    ///
    /// The reference only rolls forward while no episode is open, the return tracker measures
    /// against it for the whole episode.
    pub fn observe(&mut self, snapshot: Snapshot, now: Instant, window: Duration) {
        if !self.is_triggered() && now.saturating_duration_since(self.last_window_update) >= window
        {
            self.window_start_ref = snapshot.clone();
            self.last_window_update = now;
            self.last_triggered_level = 0.0;
        }
        self.latest = snapshot;
    }

    /// Close the open episode and return it. `last_triggered_level` resets with it.
    pub fn reset_episode(&mut self) -> Option<Episode> {
        self.last_triggered_level = 0.0;
        self.episode.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    fn snapshot(price: f64) -> Snapshot {
        Snapshot::new("ETH_USDT".into(), price, price, 5_000.0)
    }

    fn episode(now: Instant) -> Episode {
        Episode {
            record_id: RecordId(1),
            direction: Direction::Up,
            trigger_time: now,
            current_window: Duration::from_secs(600),
            trigger_ref: snapshot(100.0),
            win_probability: -1.0,
            forced_pin: false,
        }
    }

    #[test]
    fn test_observe_keeps_reference_inside_window() {
        let start = Instant::now();
        let mut state = TickerState::new(snapshot(100.0), start);
        state.last_triggered_level = 0.03;

        state.observe(snapshot(101.0), start + Duration::from_secs(10), WINDOW);

        assert_eq!(state.window_start_ref, snapshot(100.0));
        assert_eq!(state.latest, snapshot(101.0));
        assert_eq!(state.last_triggered_level, 0.03);
    }

    #[test]
    fn test_observe_rolls_idle_reference() {
        let start = Instant::now();
        let mut state = TickerState::new(snapshot(100.0), start);
        state.last_triggered_level = 0.03;

        state.observe(snapshot(102.0), start + WINDOW, WINDOW);

        assert_eq!(state.window_start_ref, snapshot(102.0));
        assert_eq!(state.last_window_update, start + WINDOW);
        assert_eq!(state.last_triggered_level, 0.0);
    }

    #[test]
    fn test_observe_never_rolls_during_episode() {
        let start = Instant::now();
        let mut state = TickerState::new(snapshot(100.0), start);
        state.episode = Some(episode(start));
        state.last_triggered_level = 0.03;

        state.observe(snapshot(104.0), start + WINDOW * 3, WINDOW);

        assert_eq!(state.window_start_ref, snapshot(100.0));
        assert_eq!(state.latest, snapshot(104.0));
        assert_eq!(state.last_triggered_level, 0.03);
    }

    #[test]
    fn test_reset_episode() {
        let start = Instant::now();
        let mut state = TickerState::new(snapshot(100.0), start);
        state.episode = Some(episode(start));
        state.last_triggered_level = 0.05;

        assert_eq!(state.reset_episode().map(|e| e.record_id), Some(RecordId(1)));
        assert!(!state.is_triggered());
        assert_eq!(state.record_id(), None);
        assert_eq!(state.direction(), None);
        assert_eq!(state.last_triggered_level, 0.0);
    }
}
