use crate::config::minutes;
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Persistence identifier of a [`SplashRecord`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, From, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct RecordId(pub i64);

/// Immutable per-symbol ticker snapshot supplied by a [`FeedSource`](crate::feed::FeedSource).
#[derive(Debug, Clone, PartialEq, Constructor, Deserialize, Serialize)]
pub struct Snapshot {
    pub symbol: SmolStr,
    pub last_price: f64,
    pub fair_price: f64,
    pub volume_24h: f64,
}

impl Snapshot {
    /// Both prices are usable as a relative-change denominator.
    pub fn is_priced(&self) -> bool {
        self.last_price > 0.0 && self.fair_price > 0.0
    }

    /// Largest relative move of the last or fair price away from `reference`.
    ///
    /// Returns `None` if either snapshot cannot be compared.
    pub fn max_change_from(&self, reference: &Snapshot) -> Option<f64> {
        if !self.is_priced() || !reference.is_priced() {
            return None;
        }

        let last_change = (self.last_price - reference.last_price).abs() / reference.last_price;
        let fair_change = (self.fair_price - reference.fair_price).abs() / reference.fair_price;
        Some(last_change.max(fair_change))
    }

    /// Percentage divergence between the traded and fair price.
    pub fn basis_gap(&self) -> f64 {
        if self.fair_price <= 0.0 {
            return 0.0;
        }
        (self.last_price - self.fair_price).abs() / self.fair_price * 100.0
    }
}

/// Direction of a splash episode relative to its reference window.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[display("UP")]
    Up,
    #[display("DOWN")]
    Down,
}

impl Direction {
    /// `Down` if the last price fell below the reference last price, otherwise `Up`.
    pub fn of_move(last_price: f64, reference_last_price: f64) -> Self {
        if last_price < reference_last_price {
            Direction::Down
        } else {
            Direction::Up
        }
    }
}

/// Lifecycle status carried by every [`SplashEvent`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SplashStatus {
    #[display("ACTIVE")]
    Active,
    #[display("RETURNED")]
    Returned,
    #[display("TIMEOUT")]
    Timeout,
}

/// Fields known when a new episode is persisted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NewSplashRecord {
    pub symbol: SmolStr,
    pub direction: Direction,
    pub trigger_level: u32,
    pub ref_last_price: f64,
    pub ref_fair_price: f64,
    pub trigger_last_price: f64,
    pub trigger_fair_price: f64,
    pub trigger_time: DateTime<Utc>,
    pub volume_24h: f64,
    pub basis_gap: f64,
    pub speed_secs: f64,
    pub window: Duration,
    pub win_probability: f64,
}

/// Persisted splash episode.
///
/// Created at activation, updated on progression and at resolution, never deleted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SplashRecord {
    pub id: RecordId,
    pub symbol: SmolStr,
    pub direction: Direction,
    pub trigger_level: u32,
    pub ref_last_price: f64,
    pub ref_fair_price: f64,
    pub trigger_last_price: f64,
    pub trigger_fair_price: f64,
    pub trigger_time: DateTime<Utc>,
    pub volume_24h: f64,
    pub basis_gap: f64,
    pub speed_secs: f64,
    pub window: Duration,
    pub returned: bool,
    /// `None` until the episode is resolved.
    pub return_time: Option<Duration>,
    pub max_deviation: f64,
    pub win_probability: f64,
}

impl SplashRecord {
    pub fn new(id: RecordId, record: NewSplashRecord) -> Self {
        let NewSplashRecord {
            symbol,
            direction,
            trigger_level,
            ref_last_price,
            ref_fair_price,
            trigger_last_price,
            trigger_fair_price,
            trigger_time,
            volume_24h,
            basis_gap,
            speed_secs,
            window,
            win_probability,
        } = record;

        Self {
            id,
            symbol,
            direction,
            trigger_level,
            ref_last_price,
            ref_fair_price,
            trigger_last_price,
            trigger_fair_price,
            trigger_time,
            volume_24h,
            basis_gap,
            speed_secs,
            window,
            returned: false,
            return_time: None,
            max_deviation: 0.0,
            win_probability,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.return_time.is_some()
    }
}

/// Status event delivered to a [`Notifier`](crate::notify::Notifier).
///
/// Events for one symbol are not strictly ordered across episodes: the `RETURNED` or `TIMEOUT`
/// event of an episode is emitted after its state is reset, so it can follow the `ACTIVE` event
/// of the next episode. Correlate events by `recordId`, not by symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplashEvent {
    pub record_id: RecordId,
    pub symbol: SmolStr,
    pub direction: Direction,
    pub level: u32,
    #[serde(with = "minutes")]
    pub window: Duration,
    pub probability: f64,
    pub ref_last: f64,
    pub ref_fair: f64,
    pub last_price: f64,
    pub fair_price: f64,
    pub basis_gap: f64,
    pub speed_seconds: f64,
    pub volume: f64,
    pub status: SplashStatus,
    /// Display hint: keep the event on screen until it resolves.
    pub pinned: bool,
    pub return_secs: Option<f64>,
    pub max_deviation: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SplashEvent {
    /// Probability above which an event is pinned regardless of its tier.
    pub const PIN_PROBABILITY: f64 = 60.0;

    pub fn should_pin(probability: f64, forced: bool, status: SplashStatus) -> bool {
        (probability > Self::PIN_PROBABILITY || forced) && status != SplashStatus::Returned
    }
}
