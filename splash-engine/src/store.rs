//! Lock-guarded symbol → [`TickerState`] map.
//!
//! Every operation is a single read-then-conditionally-update critical section. The lock is
//! never exposed and never held across an `.await`.

use crate::{
    model::{RecordId, Snapshot},
    state::{Episode, TickerState},
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct StateStore {
    states: Mutex<FnvHashMap<SmolStr, TickerState>>,
}

/// What a return tracker needs from the state of the episode it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerView {
    pub level: f64,
    pub current_window: Duration,
    pub trigger_time: Instant,
    pub latest: Snapshot,
}

/// An episode claimed for resolution, plus the state it was claimed from.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedEpisode {
    pub episode: Episode,
    pub level: f64,
    pub latest: Snapshot,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window manager entry point.
    ///
    /// Returns the updated state for symbols seen before, `None` when the snapshot initialised
    /// a new symbol (nothing to compare against yet).
    pub fn observe(&self, snapshot: &Snapshot, now: Instant, window: Duration) -> Option<TickerState> {
        let mut states = self.states.lock();
        match states.get_mut(&snapshot.symbol) {
            Some(state) => {
                state.observe(snapshot.clone(), now, window);
                Some(state.clone())
            }
            None => {
                states.insert(
                    snapshot.symbol.clone(),
                    TickerState::new(snapshot.clone(), now),
                );
                None
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<TickerState> {
        self.states.lock().get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    /// Open `episode` on `symbol` if no episode is open. Returns whether it was opened.
    pub fn activate(&self, symbol: &str, episode: Episode, level: f64) -> bool {
        let mut states = self.states.lock();
        match states.get_mut(symbol) {
            Some(state) if !state.is_triggered() => {
                state.episode = Some(episode);
                state.last_triggered_level = level;
                true
            }
            _ => false,
        }
    }

    /// Advance the open episode `record_id` to a strictly higher `level`.
    pub fn progress(
        &self,
        symbol: &str,
        record_id: RecordId,
        level: f64,
        window: Duration,
        win_probability: f64,
        forced_pin: bool,
    ) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(symbol) else {
            return false;
        };
        if level <= state.last_triggered_level {
            return false;
        }
        match state.episode.as_mut() {
            Some(episode) if episode.record_id == record_id => {
                episode.current_window = window;
                episode.win_probability = win_probability;
                episode.forced_pin = forced_pin;
                state.last_triggered_level = level;
                true
            }
            _ => false,
        }
    }

    /// Read the episode `record_id` is bound to, `None` if it is no longer the open episode.
    pub fn tracker_view(&self, symbol: &str, record_id: RecordId) -> Option<TrackerView> {
        let states = self.states.lock();
        let state = states.get(symbol)?;
        let episode = state
            .episode
            .as_ref()
            .filter(|episode| episode.record_id == record_id)?;

        Some(TrackerView {
            level: state.last_triggered_level,
            current_window: episode.current_window,
            trigger_time: episode.trigger_time,
            latest: state.latest.clone(),
        })
    }

    /// Atomically claim and reset the open episode `record_id`.
    ///
    /// Exactly one caller per episode receives `Some`, every other caller gets `None`.
    pub fn finish(&self, symbol: &str, record_id: RecordId) -> Option<FinishedEpisode> {
        let mut states = self.states.lock();
        let state = states.get_mut(symbol)?;
        if state.record_id() != Some(record_id) {
            return None;
        }

        let level = state.last_triggered_level;
        let latest = state.latest.clone();
        state.reset_episode().map(|episode| FinishedEpisode {
            episode,
            level,
            latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    const WINDOW: Duration = Duration::from_secs(300);

    fn snapshot(price: f64) -> Snapshot {
        Snapshot::new("SOL_USDT".into(), price, price, 10_000.0)
    }

    fn episode(record_id: i64, now: Instant) -> Episode {
        Episode {
            record_id: RecordId(record_id),
            direction: Direction::Down,
            trigger_time: now,
            current_window: Duration::from_secs(600),
            trigger_ref: snapshot(100.0),
            win_probability: 40.0,
            forced_pin: false,
        }
    }

    #[test]
    fn test_observe_initialises_unseen_symbol() {
        let store = StateStore::new();
        let now = Instant::now();

        assert_eq!(store.observe(&snapshot(100.0), now, WINDOW), None);
        let state = store.observe(&snapshot(101.0), now, WINDOW).unwrap();
        assert_eq!(state.window_start_ref, snapshot(100.0));
        assert_eq!(state.latest, snapshot(101.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_activate_only_when_idle() {
        let store = StateStore::new();
        let now = Instant::now();
        store.observe(&snapshot(100.0), now, WINDOW);

        assert!(!store.activate("UNKNOWN", episode(1, now), 0.03));
        assert!(store.activate("SOL_USDT", episode(1, now), 0.03));
        assert!(!store.activate("SOL_USDT", episode(2, now), 0.05));

        let state = store.get("SOL_USDT").unwrap();
        assert_eq!(state.record_id(), Some(RecordId(1)));
        assert_eq!(state.last_triggered_level, 0.03);
    }

    #[test]
    fn test_progress_is_monotonic_and_bound_to_record() {
        let store = StateStore::new();
        let now = Instant::now();
        store.observe(&snapshot(100.0), now, WINDOW);
        store.activate("SOL_USDT", episode(1, now), 0.03);

        let window = Duration::from_secs(900);
        assert!(!store.progress("SOL_USDT", RecordId(2), 0.05, window, 50.0, false));
        assert!(!store.progress("SOL_USDT", RecordId(1), 0.03, window, 50.0, false));
        assert!(store.progress("SOL_USDT", RecordId(1), 0.05, window, 50.0, true));
        assert!(!store.progress("SOL_USDT", RecordId(1), 0.04, window, 50.0, false));

        let state = store.get("SOL_USDT").unwrap();
        let episode = state.episode.unwrap();
        assert_eq!(state.last_triggered_level, 0.05);
        assert_eq!(episode.current_window, window);
        assert_eq!(episode.win_probability, 50.0);
        assert!(episode.forced_pin);
    }

    #[test]
    fn test_tracker_view_guards_stale_record() {
        let store = StateStore::new();
        let now = Instant::now();
        store.observe(&snapshot(100.0), now, WINDOW);
        assert_eq!(store.tracker_view("SOL_USDT", RecordId(1)), None);

        store.activate("SOL_USDT", episode(1, now), 0.03);
        store.observe(&snapshot(98.0), now, WINDOW);

        let view = store.tracker_view("SOL_USDT", RecordId(1)).unwrap();
        assert_eq!(view.level, 0.03);
        assert_eq!(view.latest, snapshot(98.0));
        assert_eq!(store.tracker_view("SOL_USDT", RecordId(9)), None);
    }

    #[test]
    fn test_finish_claims_exactly_once() {
        let store = StateStore::new();
        let now = Instant::now();
        store.observe(&snapshot(100.0), now, WINDOW);
        store.activate("SOL_USDT", episode(1, now), 0.05);

        assert_eq!(store.finish("SOL_USDT", RecordId(2)), None);

        let finished = store.finish("SOL_USDT", RecordId(1)).unwrap();
        assert_eq!(finished.episode.record_id, RecordId(1));
        assert_eq!(finished.level, 0.05);
        assert_eq!(store.finish("SOL_USDT", RecordId(1)), None);

        let state = store.get("SOL_USDT").unwrap();
        assert!(!state.is_triggered());
        assert_eq!(state.record_id(), None);
        assert_eq!(state.last_triggered_level, 0.0);

        // Eligible for a new episode straight away
        assert!(store.activate("SOL_USDT", episode(2, now), 0.03));
    }
}
