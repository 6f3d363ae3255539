//! SQLite-based store implementation.
//!
//! Timestamps are stored as epoch milliseconds. Every claim, completion and token
//! acquisition is a single statement or an `IMMEDIATE` transaction, so several
//! processes may share one database file.

mod bars;
mod jobs;
mod rate;
mod registry;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use backfill_core::{BackfillError, Result, RetryPolicy};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE,
    asset_class TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    provider TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    is_intraday INTEGER NOT NULL,
    is_forecast INTEGER NOT NULL DEFAULT 0,
    confidence REAL,
    confidence_key REAL NOT NULL DEFAULT 0,
    fetched_at INTEGER NOT NULL,
    UNIQUE (symbol, timeframe, ts, provider, is_forecast, confidence_key)
);

CREATE INDEX IF NOT EXISTS idx_bars_series ON bars(symbol, timeframe, ts);

CREATE TABLE IF NOT EXISTS backfill_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    total_chunks INTEGER NOT NULL DEFAULT 0,
    done_chunks INTEGER NOT NULL DEFAULT 0,
    error_chunks INTEGER NOT NULL DEFAULT 0,
    progress_pct REAL NOT NULL DEFAULT 0,
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (symbol, timeframe)
);

CREATE TABLE IF NOT EXISTS backfill_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES backfill_jobs(id),
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    claims INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    available_at INTEGER NOT NULL,
    lease_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (job_id, window_start, window_end)
);

CREATE INDEX IF NOT EXISTS idx_chunks_claim
    ON backfill_chunks(status, priority DESC, available_at);
CREATE INDEX IF NOT EXISTS idx_chunks_series
    ON backfill_chunks(symbol, timeframe, window_start);

CREATE TABLE IF NOT EXISTS job_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    lookback_sessions INTEGER NOT NULL,
    last_scanned_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (symbol, timeframe)
);

CREATE TABLE IF NOT EXISTS rate_buckets (
    provider TEXT PRIMARY KEY,
    capacity REAL NOT NULL,
    tokens REAL NOT NULL,
    refill_per_sec REAL NOT NULL,
    last_refill REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    chunk_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    status TEXT NOT NULL,
    rows_written INTEGER NOT NULL DEFAULT 0,
    provider TEXT,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    started_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_series ON job_runs(symbol, timeframe, started_at);
";

/// SQLite-based store for bars, jobs, coverage definitions and rate buckets.
///
/// The connection is guarded by a mutex; every trait method holds it for the
/// duration of one statement or transaction and never across an `.await`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite store at the given path.
    ///
    /// Enables WAL journaling and a busy timeout so that several processes can share
    /// the file.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store.
    ///
    /// Useful for testing; data is lost when the store is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Sets the retry policy applied when completing failed chunks.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        debug!("SQLite store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(store_err)
    }
}

pub(crate) fn store_err(e: impl ToString) -> BackfillError {
    BackfillError::Store(e.to_string())
}

pub(crate) fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

/// Epoch seconds with millisecond precision, used by the rate bucket table.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn conversion_err(idx: usize, ty: Type, e: BackfillError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        conversion_err(
            idx,
            Type::Integer,
            BackfillError::Parse(format!("Timestamp out of range: {ms}")),
        )
    })
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or_else(|| {
            conversion_err(
                idx,
                Type::Integer,
                BackfillError::Parse(format!("Timestamp out of range: {ms}")),
            )
        })
    })
    .transpose()
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn secs_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: f64 = row.get(idx)?;
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64).ok_or_else(|| {
        conversion_err(
            idx,
            Type::Real,
            BackfillError::Parse(format!("Timestamp out of range: {secs}")),
        )
    })
}

pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = BackfillError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, Type::Text, e))
}

pub(crate) fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let n: i64 = row.get(idx)?;
    Ok(u64::try_from(n).unwrap_or(0))
}

pub(crate) fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
