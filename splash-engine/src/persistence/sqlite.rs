//! SQLite-backed [`SplashRepository`].
//!
//! One `splash_records` table, one row per episode. The maturity filter of the context query
//! runs in SQL so statistics never load whole records.

use super::{LevelUpdate, MATURITY_BASE, MATURITY_PER_LEVEL, Resolution, SplashRepository};
use crate::{
    error::SplashError,
    model::{Direction, NewSplashRecord, RecordId, SplashRecord},
    stats::{ContextQuery, ContextStats},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, Row, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS splash_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        direction TEXT NOT NULL,
        trigger_level INTEGER NOT NULL,
        ref_last_price REAL NOT NULL,
        ref_fair_price REAL NOT NULL,
        trigger_last_price REAL NOT NULL,
        trigger_fair_price REAL NOT NULL,
        trigger_time_ms INTEGER NOT NULL,
        volume_24h REAL NOT NULL,
        basis_gap REAL NOT NULL,
        speed_secs REAL NOT NULL,
        window_secs INTEGER NOT NULL,
        returned INTEGER NOT NULL DEFAULT 0,
        return_time_ms INTEGER NULL,
        max_deviation REAL NOT NULL DEFAULT 0,
        win_probability REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_splash_records_context
        ON splash_records(direction, trigger_level, window_secs);
"#;

const SELECT_RECORD: &str = r#"
    SELECT id, symbol, direction, trigger_level, ref_last_price, ref_fair_price,
        trigger_last_price, trigger_fair_price, trigger_time_ms, volume_24h, basis_gap,
        speed_secs, window_secs, returned, return_time_ms, max_deviation, win_probability
    FROM splash_records
    WHERE id = ?1
"#;

/// Resolved, or older than the maturity horizon for the record's level.
const MATURE: &str = "(return_time_ms IS NOT NULL OR trigger_time_ms < :now - (:base + trigger_level * :per_level))";

/// Durable [`SplashRepository`] on a single SQLite connection.
///
/// Statements run on the blocking pool, callers never stall the runtime on disk IO.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SplashError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                SplashError::Persistence(format!("create {}: {error}", parent.display()))
            })?;
        }

        let repository = Self::with_connection(Connection::open(path)?)?;
        info!(path = %path.display(), "splash record database opened");
        Ok(repository)
    }

    pub fn open_in_memory() -> Result<Self, SplashError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SplashError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<Op, T>(&self, op: Op) -> Result<T, SplashError>
    where
        Op: FnOnce(&Connection) -> Result<T, SplashError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&conn.lock()))
            .await
            .map_err(|error| SplashError::Persistence(format!("sqlite task failed: {error}")))?
    }
}

#[async_trait]
impl SplashRepository for SqliteRepository {
    async fn save_record(&self, record: NewSplashRecord) -> Result<RecordId, SplashError> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO splash_records (
                    symbol, direction, trigger_level, ref_last_price, ref_fair_price,
                    trigger_last_price, trigger_fair_price, trigger_time_ms, volume_24h,
                    basis_gap, speed_secs, window_secs, win_probability
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    record.symbol.as_str(),
                    record.direction,
                    record.trigger_level,
                    record.ref_last_price,
                    record.ref_fair_price,
                    record.trigger_last_price,
                    record.trigger_fair_price,
                    record.trigger_time.timestamp_millis(),
                    record.volume_24h,
                    record.basis_gap,
                    record.speed_secs,
                    as_secs(record.window),
                    record.win_probability,
                ],
            )?;

            let id = RecordId(conn.last_insert_rowid());
            debug!(%id, "splash record saved");
            Ok(id)
        })
        .await
    }

    async fn update_record_level(
        &self,
        id: RecordId,
        update: LevelUpdate,
    ) -> Result<(), SplashError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE splash_records
                SET trigger_level = ?2, trigger_last_price = ?3, trigger_fair_price = ?4,
                    volume_24h = ?5, win_probability = ?6, window_secs = ?7
                WHERE id = ?1
                "#,
                params![
                    id.0,
                    update.level,
                    update.last_price,
                    update.fair_price,
                    update.volume_24h,
                    update.win_probability,
                    as_secs(update.window),
                ],
            )?;
            expect_one(changed, id)
        })
        .await
    }

    async fn update_record_resolution(
        &self,
        id: RecordId,
        resolution: Resolution,
    ) -> Result<(), SplashError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE splash_records
                SET returned = ?2, return_time_ms = ?3, max_deviation = ?4
                WHERE id = ?1
                "#,
                params![
                    id.0,
                    resolution.returned,
                    as_millis(resolution.return_time),
                    resolution.max_deviation,
                ],
            )?;
            expect_one(changed, id)
        })
        .await
    }

    async fn get_record(&self, id: RecordId) -> Result<SplashRecord, SplashError> {
        self.with_conn(move |conn| {
            conn.query_row(SELECT_RECORD, [id.0], record_from_row)
                .optional()?
                .ok_or(SplashError::RecordNotFound(id))
        })
        .await
    }

    async fn context_stats(&self, query: &ContextQuery) -> Result<ContextStats, SplashError> {
        let query = query.clone();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let sql = format!(
                r#"
                SELECT COUNT(*), COALESCE(SUM(CASE WHEN returned THEN 1 ELSE 0 END), 0)
                FROM splash_records
                WHERE direction = :direction AND trigger_level = :level AND window_secs = :window
                    AND volume_24h BETWEEN :volume_min AND :volume_max
                    AND basis_gap BETWEEN :gap_min AND :gap_max
                    AND {MATURE}
                "#
            );
            conn.query_row(
                &sql,
                rusqlite::named_params! {
                    ":direction": query.direction,
                    ":level": query.level,
                    ":window": as_secs(query.window),
                    ":volume_min": query.volume_range.start(),
                    ":volume_max": query.volume_range.end(),
                    ":gap_min": query.basis_gap_range.start(),
                    ":gap_max": query.basis_gap_range.end(),
                    ":now": now,
                    ":base": as_millis(MATURITY_BASE),
                    ":per_level": as_millis(MATURITY_PER_LEVEL),
                },
                stats_from_row,
            )
            .map_err(SplashError::from)
        })
        .await
    }

    async fn direction_stats(&self, direction: Direction) -> Result<ContextStats, SplashError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let sql = format!(
                r#"
                SELECT COUNT(*), COALESCE(SUM(CASE WHEN returned THEN 1 ELSE 0 END), 0)
                FROM splash_records
                WHERE direction = :direction AND {MATURE}
                "#
            );
            conn.query_row(
                &sql,
                rusqlite::named_params! {
                    ":direction": direction,
                    ":now": now,
                    ":base": as_millis(MATURITY_BASE),
                    ":per_level": as_millis(MATURITY_PER_LEVEL),
                },
                stats_from_row,
            )
            .map_err(SplashError::from)
        })
        .await
    }
}

impl ToSql for Direction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }))
    }
}

impl FromSql for Direction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            other => Err(FromSqlError::Other(
                format!("unknown direction {other}").into(),
            )),
        }
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SplashRecord> {
    let trigger_time_ms: i64 = row.get(8)?;
    let window_secs: i64 = row.get(12)?;
    let return_time_ms: Option<i64> = row.get(14)?;

    Ok(SplashRecord {
        id: RecordId(row.get(0)?),
        symbol: row.get::<_, String>(1)?.into(),
        direction: row.get(2)?,
        trigger_level: row.get(3)?,
        ref_last_price: row.get(4)?,
        ref_fair_price: row.get(5)?,
        trigger_last_price: row.get(6)?,
        trigger_fair_price: row.get(7)?,
        trigger_time: DateTime::from_timestamp_millis(trigger_time_ms).unwrap_or_default(),
        volume_24h: row.get(9)?,
        basis_gap: row.get(10)?,
        speed_secs: row.get(11)?,
        window: Duration::from_secs(u64::try_from(window_secs).unwrap_or_default()),
        returned: row.get(13)?,
        return_time: return_time_ms
            .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or_default())),
        max_deviation: row.get(15)?,
        win_probability: row.get(16)?,
    })
}

fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<ContextStats> {
    let total: i64 = row.get(0)?;
    let wins: i64 = row.get(1)?;
    Ok(ContextStats {
        total: u64::try_from(total).unwrap_or_default(),
        wins: u64::try_from(wins).unwrap_or_default(),
    })
}

fn expect_one(changed: usize, id: RecordId) -> Result<(), SplashError> {
    match changed {
        0 => Err(SplashError::RecordNotFound(id)),
        _ => Ok(()),
    }
}

fn as_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
