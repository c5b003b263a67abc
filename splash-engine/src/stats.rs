use crate::{config::EngineConfig, model::Direction};
use serde::{Deserialize, Serialize};
use std::{ops::RangeInclusive, time::Duration};

/// Probability reported when too few mature records match the context.
pub const INSUFFICIENT_SAMPLE: f64 = -1.0;

/// Historical context a new or progressed episode is compared against.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextQuery {
    pub direction: Direction,
    pub level: u32,
    pub volume_range: RangeInclusive<f64>,
    pub basis_gap_range: RangeInclusive<f64>,
    pub window: Duration,
}

impl ContextQuery {
    pub fn new(
        config: &EngineConfig,
        direction: Direction,
        level: u32,
        volume_24h: f64,
        basis_gap: f64,
        window: Duration,
    ) -> Self {
        let (volume_lower, volume_upper) = config.volume_band;
        Self {
            direction,
            level,
            volume_range: volume_24h * volume_lower..=volume_24h * volume_upper,
            basis_gap_range: basis_gap - config.basis_gap_band..=basis_gap + config.basis_gap_band,
            window,
        }
    }
}

/// Mature record count and how many of them returned.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ContextStats {
    pub total: u64,
    pub wins: u64,
}

impl ContextStats {
    /// Rounded win rate in percent, or [`INSUFFICIENT_SAMPLE`] below `min_sample` records.
    pub fn win_probability(&self, min_sample: u64) -> f64 {
        if self.total == 0 || self.total < min_sample {
            return INSUFFICIENT_SAMPLE;
        }
        (self.wins as f64 / self.total as f64 * 100.0).round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_probability() {
        struct TestCase {
            input: ContextStats,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: empty history
                input: ContextStats { total: 0, wins: 0 },
                expected: INSUFFICIENT_SAMPLE,
            },
            TestCase {
                // TC1: below minimum sample regardless of wins
                input: ContextStats { total: 2, wins: 2 },
                expected: INSUFFICIENT_SAMPLE,
            },
            TestCase {
                // TC2: exactly the minimum sample
                input: ContextStats { total: 3, wins: 1 },
                expected: 33.0,
            },
            TestCase {
                // TC3: 7 of 10 returned
                input: ContextStats { total: 10, wins: 7 },
                expected: 70.0,
            },
            TestCase {
                // TC4: rounds half away from zero
                input: ContextStats { total: 8, wins: 5 },
                expected: 63.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.win_probability(3);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_context_query_bands() {
        let query = ContextQuery::new(
            &EngineConfig::default(),
            Direction::Up,
            5,
            1_000.0,
            1.2,
            Duration::from_secs(900),
        );

        assert_eq!(query.volume_range, 500.0..=2_000.0);
        assert!((query.basis_gap_range.start() - 0.7).abs() < 1e-12);
        assert!((query.basis_gap_range.end() - 1.7).abs() < 1e-12);
        assert_eq!(query.level, 5);
    }
}
