//! Engine configuration and the hot-replaceable [`TierSet`].
//!
//! Defaults mirror the production settings the engine was tuned with. Every value can be
//! overridden through the environment via [`EngineConfig::from_env`].

use crate::error::SplashError;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{info, warn};

/// Severity tier: a percent threshold and the time budget allowed for the price to return.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    /// Threshold in percent, eg/ `3.0` for a 3% move.
    pub level: f64,
    #[serde(with = "minutes")]
    pub window: Duration,
    #[serde(default)]
    pub is_forced_pin: bool,
}

impl Tier {
    pub fn new(level: f64, window: Duration) -> Self {
        Self {
            level,
            window,
            is_forced_pin: false,
        }
    }

    pub fn with_forced_pin(mut self, forced: bool) -> Self {
        self.is_forced_pin = forced;
        self
    }

    /// Threshold as a fraction, comparable against relative price changes.
    pub fn threshold(&self) -> f64 {
        self.level / 100.0
    }

    /// Integer percent level recorded against episodes.
    pub fn level_percent(&self) -> u32 {
        self.level.round().max(0.0) as u32
    }
}

/// Ordered tier list shared between the polling loop and whoever reconfigures it.
///
/// Readers take an [`Arc`] snapshot so one evaluation always sees one consistent set, and a
/// replacement never touches episodes already in flight.
#[derive(Debug, Default)]
pub struct TierSet {
    tiers: RwLock<Arc<Vec<Tier>>>,
}

impl TierSet {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self {
            tiers: RwLock::new(Arc::new(sort_tiers(tiers))),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Tier>> {
        self.tiers.read().clone()
    }

    pub fn replace(&self, tiers: Vec<Tier>) {
        let tiers = sort_tiers(tiers);
        info!(tiers = tiers.len(), "splash tier set replaced");
        *self.tiers.write() = Arc::new(tiers);
    }
}

fn sort_tiers(tiers: Vec<Tier>) -> Vec<Tier> {
    tiers
        .into_iter()
        .sorted_by(|a, b| a.level.total_cmp(&b.level))
        .collect()
}

/// Parse a tier list from JSON.
///
/// Accepts either a bare array or the settings envelope `{"tiers": [...]}`.
pub fn parse_tiers(input: &str) -> Result<Vec<Tier>, SplashError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TiersJson {
        Bare(Vec<Tier>),
        Envelope { tiers: Vec<Tier> },
    }

    let tiers = match serde_json::from_str::<TiersJson>(input)
        .map_err(|error| SplashError::InvalidConfig(format!("tiers: {error}")))?
    {
        TiersJson::Bare(tiers) | TiersJson::Envelope { tiers } => tiers,
    };

    validate_tiers(&tiers)?;
    Ok(tiers)
}

/// Reject tiers whose level is not a finite, positive percentage.
///
/// An empty list is valid and disables detection.
pub fn validate_tiers(tiers: &[Tier]) -> Result<(), SplashError> {
    match tiers
        .iter()
        .find(|tier| !tier.level.is_finite() || tier.level <= 0.0)
    {
        Some(tier) => Err(SplashError::InvalidConfig(format!(
            "tier level must be a positive percentage, got {}",
            tier.level
        ))),
        None => Ok(()),
    }
}

/// Default tier ladder: 3% within 10 minutes, 5% within 15 minutes.
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier::new(3.0, Duration::from_secs(10 * 60)),
        Tier::new(5.0, Duration::from_secs(15 * 60)),
    ]
}

/// Tunables for the polling loop, the window manager and the return tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Feed polling cadence.
    pub poll_interval: Duration,
    /// How long an idle symbol keeps its reference snapshot before it is rolled forward.
    pub window_duration: Duration,
    /// Return tracker polling cadence.
    pub tracker_interval: Duration,
    /// Tracker ticks skipped right after an episode opens.
    pub tracker_warmup_ticks: u32,
    pub base_tolerance: f64,
    pub tolerance_scale: f64,
    /// Minimum number of mature historical records before a win-rate is reported.
    pub min_sample: u64,
    /// Volume band as (lower, upper) multipliers of the current 24h volume.
    pub volume_band: (f64, f64),
    /// Half-width of the basis gap band, in percentage points.
    pub basis_gap_band: f64,
    pub tiers: Vec<Tier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            window_duration: Duration::from_secs(5 * 60),
            tracker_interval: Duration::from_millis(50),
            tracker_warmup_ticks: 2,
            base_tolerance: 0.005,
            tolerance_scale: 0.1,
            min_sample: 3,
            volume_band: (0.5, 2.0),
            basis_gap_band: 0.5,
            tiers: default_tiers(),
        }
    }
}

impl EngineConfig {
    /// Overlay environment variables on the defaults.
    ///
    /// Unparseable scalar values fall back to their default with a warning, an unparseable
    /// `SPLASH_TIERS` is rejected.
    pub fn from_env() -> Result<Self, SplashError> {
        let defaults = Self::default();

        let mut config = Self {
            poll_interval: Duration::from_millis(env_or(
                "SPLASH_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            window_duration: Duration::from_secs(env_or(
                "SPLASH_WINDOW_SECS",
                defaults.window_duration.as_secs(),
            )),
            tracker_interval: Duration::from_millis(env_or(
                "SPLASH_TRACKER_INTERVAL_MS",
                defaults.tracker_interval.as_millis() as u64,
            )),
            base_tolerance: env_or("SPLASH_BASE_TOLERANCE", defaults.base_tolerance),
            tolerance_scale: env_or("SPLASH_TOLERANCE_SCALE", defaults.tolerance_scale),
            ..defaults
        };

        if let Ok(raw) = std::env::var("SPLASH_TIERS") {
            config.tiers = parse_tiers(&raw)?;
        }

        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_window_duration(mut self, window: Duration) -> Self {
        self.window_duration = window;
        self
    }

    pub fn with_tracker_interval(mut self, interval: Duration) -> Self {
        self.tracker_interval = interval;
        self
    }

    pub fn with_tracker_warmup_ticks(mut self, ticks: u32) -> Self {
        self.tracker_warmup_ticks = ticks;
        self
    }

    pub fn with_tolerance(mut self, base: f64, scale: f64) -> Self {
        self.base_tolerance = base;
        self.tolerance_scale = scale;
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = tiers;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, ?default, "unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// (De)serialise a [`Duration`] as whole minutes.
pub mod minutes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs() / 60)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let minutes = u64::deserialize(deserializer)?;
        minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| D::Error::custom(format!("window of {minutes} minutes is too large")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tiers() {
        struct TestCase {
            input: &'static str,
            expected: Result<Vec<Tier>, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: bare array in settings wire format
                input: r#"[{"level": 3, "window": 10, "isForcedPin": false}]"#,
                expected: Ok(vec![Tier::new(3.0, Duration::from_secs(600))]),
            },
            TestCase {
                // TC1: settings envelope, isForcedPin defaults to false
                input: r#"{"tiers": [{"level": 5, "window": 15}, {"level": 8, "window": 20, "isForcedPin": true}]}"#,
                expected: Ok(vec![
                    Tier::new(5.0, Duration::from_secs(900)),
                    Tier::new(8.0, Duration::from_secs(1200)).with_forced_pin(true),
                ]),
            },
            TestCase {
                // TC2: garbage is rejected
                input: r#"{"levels": 3}"#,
                expected: Err(()),
            },
            TestCase {
                // TC3: window in minutes overflows seconds
                input: r#"[{"level": 3, "window": 18446744073709551615}]"#,
                expected: Err(()),
            },
            TestCase {
                // TC4: zero level
                input: r#"[{"level": 0, "window": 10}]"#,
                expected: Err(()),
            },
            TestCase {
                // TC5: negative level in the envelope
                input: r#"{"tiers": [{"level": 3, "window": 10}, {"level": -2, "window": 5}]}"#,
                expected: Err(()),
            },
            TestCase {
                // TC6: empty list disables detection
                input: r#"[]"#,
                expected: Ok(vec![]),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_tiers(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_tier_set_sorts_and_replaces() {
        let tiers = TierSet::new(vec![
            Tier::new(5.0, Duration::from_secs(900)),
            Tier::new(3.0, Duration::from_secs(600)),
        ]);

        let before = tiers.snapshot();
        assert_eq!(before.iter().map(|t| t.level).collect::<Vec<_>>(), vec![3.0, 5.0]);

        tiers.replace(vec![
            Tier::new(10.0, Duration::from_secs(60)),
            Tier::new(2.0, Duration::from_secs(60)),
        ]);

        // Snapshots taken before the swap are unaffected
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].level, 3.0);
        assert_eq!(
            tiers.snapshot().iter().map(|t| t.level).collect::<Vec<_>>(),
            vec![2.0, 10.0]
        );
    }

    #[test]
    fn test_tier_helpers() {
        let tier = Tier::new(4.6, Duration::from_secs(60));
        assert!((tier.threshold() - 0.046).abs() < 1e-12);
        assert_eq!(tier.level_percent(), 5);
        assert_eq!(Tier::new(-2.0, Duration::ZERO).level_percent(), 0);
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.window_duration, Duration::from_secs(300));
        assert_eq!(config.tracker_interval, Duration::from_millis(50));
        assert_eq!(config.tracker_warmup_ticks, 2);
        assert_eq!(config.min_sample, 3);
        assert_eq!(config.tiers, default_tiers());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::default()
            .with_poll_interval(Duration::from_millis(50))
            .with_window_duration(Duration::from_secs(60))
            .with_tolerance(0.01, 0.2);

        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.window_duration, Duration::from_secs(60));
        assert_eq!(config.base_tolerance, 0.01);
        assert_eq!(config.tolerance_scale, 0.2);
    }
}
