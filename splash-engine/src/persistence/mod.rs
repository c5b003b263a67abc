//! Splash record storage and the historical context-statistics query.
//!
//! [`SqliteRepository`] keeps records across restarts. [`InMemoryRepository`] is process-local
//! and unbounded, meant for tests and short-lived runs.

use crate::{
    error::SplashError,
    model::{Direction, NewSplashRecord, RecordId, SplashRecord},
    stats::{ContextQuery, ContextStats},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

pub mod sqlite;

pub use sqlite::SqliteRepository;

/// Fields rewritten when an open episode progresses to a higher tier.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LevelUpdate {
    pub level: u32,
    pub last_price: f64,
    pub fair_price: f64,
    pub volume_24h: f64,
    pub win_probability: f64,
    pub window: Duration,
}

/// Outcome written when an episode resolves.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Resolution {
    pub returned: bool,
    pub return_time: Duration,
    pub max_deviation: f64,
}

#[async_trait]
pub trait SplashRepository: Send + Sync {
    async fn save_record(&self, record: NewSplashRecord) -> Result<RecordId, SplashError>;

    async fn update_record_level(&self, id: RecordId, update: LevelUpdate)
    -> Result<(), SplashError>;

    async fn update_record_resolution(
        &self,
        id: RecordId,
        resolution: Resolution,
    ) -> Result<(), SplashError>;

    /// Fails with [`SplashError::RecordNotFound`] for unknown ids.
    async fn get_record(&self, id: RecordId) -> Result<SplashRecord, SplashError>;

    /// Mature records matching `query`, and how many of them returned.
    ///
    /// A record is mature once resolved, or once it is older than [`maturity`] for its level.
    async fn context_stats(&self, query: &ContextQuery) -> Result<ContextStats, SplashError>;

    /// Mature records for `direction` across every level, window and market context.
    async fn direction_stats(&self, direction: Direction) -> Result<ContextStats, SplashError>;
}

/// Age after which an unresolved record counts towards statistics: 5 minutes plus 2 minutes
/// per percent of level.
pub fn maturity(level: u32) -> Duration {
    MATURITY_BASE + MATURITY_PER_LEVEL * level
}

pub const MATURITY_BASE: Duration = Duration::from_secs(5 * 60);
pub const MATURITY_PER_LEVEL: Duration = Duration::from_secs(2 * 60);

fn is_mature(record: &SplashRecord, now: DateTime<Utc>) -> bool {
    if record.is_resolved() {
        return true;
    }
    let age = now
        .signed_duration_since(record.trigger_time)
        .to_std()
        .unwrap_or_default();
    age > maturity(record.trigger_level)
}

fn tally<'a>(records: impl Iterator<Item = &'a SplashRecord>) -> ContextStats {
    records.fold(ContextStats::default(), |mut stats, record| {
        stats.total += 1;
        stats.wins += u64::from(record.returned);
        stats
    })
}

/// Process-local [`SplashRepository`].
///
/// Ids are assigned sequentially from 1. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    inner: Mutex<InMemoryInner>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
    next_id: i64,
    records: BTreeMap<RecordId, SplashRecord>,
    resolution_writes: u64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, eg/ historical data loaded at startup.
    pub fn insert(&self, record: SplashRecord) {
        let mut inner = self.inner.lock();
        inner.next_id = inner.next_id.max(record.id.0);
        inner.records.insert(record.id, record);
    }

    pub fn records(&self) -> Vec<SplashRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn record(&self, id: RecordId) -> Option<SplashRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Number of resolution writes applied, used to verify single finalisation.
    pub fn resolution_writes(&self) -> u64 {
        self.inner.lock().resolution_writes
    }
}

#[async_trait]
impl SplashRepository for InMemoryRepository {
    async fn save_record(&self, record: NewSplashRecord) -> Result<RecordId, SplashError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = RecordId(inner.next_id);
        inner.records.insert(id, SplashRecord::new(id, record));
        debug!(%id, "splash record saved");
        Ok(id)
    }

    async fn update_record_level(
        &self,
        id: RecordId,
        update: LevelUpdate,
    ) -> Result<(), SplashError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(SplashError::RecordNotFound(id))?;

        record.trigger_level = update.level;
        record.trigger_last_price = update.last_price;
        record.trigger_fair_price = update.fair_price;
        record.volume_24h = update.volume_24h;
        record.win_probability = update.win_probability;
        record.window = update.window;
        Ok(())
    }

    async fn update_record_resolution(
        &self,
        id: RecordId,
        resolution: Resolution,
    ) -> Result<(), SplashError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(SplashError::RecordNotFound(id))?;

        record.returned = resolution.returned;
        record.return_time = Some(resolution.return_time);
        record.max_deviation = resolution.max_deviation;
        inner.resolution_writes += 1;
        Ok(())
    }

    async fn get_record(&self, id: RecordId) -> Result<SplashRecord, SplashError> {
        self.record(id).ok_or(SplashError::RecordNotFound(id))
    }

    async fn context_stats(&self, query: &ContextQuery) -> Result<ContextStats, SplashError> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(tally(inner.records.values().filter(|record| {
            record.direction == query.direction
                && record.trigger_level == query.level
                && record.window == query.window
                && query.volume_range.contains(&record.volume_24h)
                && query.basis_gap_range.contains(&record.basis_gap)
                && is_mature(record, now)
        })))
    }

    async fn direction_stats(&self, direction: Direction) -> Result<ContextStats, SplashError> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(tally(inner.records.values().filter(|record| {
            record.direction == direction && is_mature(record, now)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use smol_str::SmolStr;

    const WINDOW: Duration = Duration::from_secs(600);

    fn new_record(direction: Direction, level: u32, volume: f64, gap: f64) -> NewSplashRecord {
        NewSplashRecord {
            symbol: SmolStr::new("PEPE_USDT"),
            direction,
            trigger_level: level,
            ref_last_price: 1.0,
            ref_fair_price: 1.0,
            trigger_last_price: 1.03,
            trigger_fair_price: 1.02,
            trigger_time: Utc::now(),
            volume_24h: volume,
            basis_gap: gap,
            speed_secs: 4.0,
            window: WINDOW,
            win_probability: -1.0,
        }
    }

    fn resolution(returned: bool) -> Resolution {
        Resolution {
            returned,
            return_time: Duration::from_secs(30),
            max_deviation: 0.04,
        }
    }

    fn query(direction: Direction, level: u32, volume: f64, gap: f64) -> ContextQuery {
        ContextQuery::new(&EngineConfig::default(), direction, level, volume, gap, WINDOW)
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let repository = InMemoryRepository::new();

        let id = repository
            .save_record(new_record(Direction::Up, 3, 1_000.0, 1.0))
            .await
            .unwrap();
        assert_eq!(id, RecordId(1));

        repository
            .update_record_level(
                id,
                LevelUpdate {
                    level: 5,
                    last_price: 1.05,
                    fair_price: 1.04,
                    volume_24h: 1_100.0,
                    win_probability: 70.0,
                    window: Duration::from_secs(900),
                },
            )
            .await
            .unwrap();
        repository
            .update_record_resolution(id, resolution(true))
            .await
            .unwrap();

        let record = repository.get_record(id).await.unwrap();
        assert_eq!(record.trigger_level, 5);
        assert_eq!(record.trigger_last_price, 1.05);
        assert_eq!(record.win_probability, 70.0);
        assert_eq!(record.window, Duration::from_secs(900));
        assert!(record.returned);
        assert_eq!(record.return_time, Some(Duration::from_secs(30)));
        assert_eq!(repository.resolution_writes(), 1);
    }

    #[tokio::test]
    async fn test_unknown_record_is_not_found() {
        let repository = InMemoryRepository::new();
        assert_eq!(
            repository.get_record(RecordId(42)).await,
            Err(SplashError::RecordNotFound(RecordId(42)))
        );
        assert_eq!(
            repository
                .update_record_resolution(RecordId(42), resolution(false))
                .await,
            Err(SplashError::RecordNotFound(RecordId(42)))
        );
    }

    #[tokio::test]
    async fn test_context_stats_counts_mature_matching_records() {
        let repository = InMemoryRepository::new();

        // Resolved and matching: 2 wins, 1 loss
        for returned in [true, true, false] {
            let id = repository
                .save_record(new_record(Direction::Up, 3, 1_000.0, 1.0))
                .await
                .unwrap();
            repository
                .update_record_resolution(id, resolution(returned))
                .await
                .unwrap();
        }

        // Unresolved and fresh: not mature yet
        repository
            .save_record(new_record(Direction::Up, 3, 1_000.0, 1.0))
            .await
            .unwrap();

        // Unresolved but older than the maturity horizon
        let mut aged = new_record(Direction::Up, 3, 1_500.0, 1.3);
        aged.trigger_time = Utc::now() - chrono::Duration::minutes(30);
        repository.save_record(aged).await.unwrap();

        // Out of context: direction, level, volume band, basis gap band
        for record in [
            new_record(Direction::Down, 3, 1_000.0, 1.0),
            new_record(Direction::Up, 5, 1_000.0, 1.0),
            new_record(Direction::Up, 3, 100.0, 1.0),
            new_record(Direction::Up, 3, 1_000.0, 2.0),
        ] {
            let id = repository.save_record(record).await.unwrap();
            repository
                .update_record_resolution(id, resolution(true))
                .await
                .unwrap();
        }

        let stats = repository
            .context_stats(&query(Direction::Up, 3, 1_000.0, 1.0))
            .await
            .unwrap();
        assert_eq!(stats, ContextStats { total: 4, wins: 2 });

        let stats = repository.direction_stats(Direction::Up).await.unwrap();
        assert_eq!(stats, ContextStats { total: 7, wins: 5 });
    }

    #[test]
    fn test_maturity() {
        assert_eq!(maturity(0), Duration::from_secs(300));
        assert_eq!(maturity(5), Duration::from_secs(900));
    }
}
