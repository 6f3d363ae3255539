use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    BackfillChunk, BackfillError, BackfillJob, ChunkClaim, ChunkOutcome, ChunkScope, ChunkStatus,
    ChunkTransition, JobProgress, JobRepository, JobRun, Result, SeedPolicy, SeededJob, Symbol,
    Timeframe, Window,
};
use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use tracing::{debug, instrument, warn};

use super::{
    SqliteStore, count_col, millis, opt_ts_col, parse_col, store_err, to_sql_count, ts_col,
};
use crate::lifecycle::{ChunkCounts, after, apply_outcome};

const CHUNK_COLUMNS: &str = "id, job_id, symbol, timeframe, window_start, window_end, status, \
                             priority, attempts, last_error, available_at, lease_expires_at, \
                             created_at, updated_at";

const JOB_COLUMNS: &str = "id, symbol, timeframe, status, priority, total_chunks, done_chunks, \
                           error_chunks, progress_pct, range_start, range_end, created_at, \
                           updated_at";

const RUN_COLUMNS: &str = "id, job_id, chunk_id, symbol, timeframe, window_start, window_end, \
                           status, rows_written, provider, error, duration_ms, started_at";

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<BackfillChunk> {
    Ok(BackfillChunk {
        id: row.get(0)?,
        job_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        timeframe: parse_col(row, 3)?,
        window: Window {
            start: ts_col(row, 4)?,
            end: ts_col(row, 5)?,
        },
        status: parse_col(row, 6)?,
        priority: row.get(7)?,
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        available_at: ts_col(row, 10)?,
        lease_expires_at: opt_ts_col(row, 11)?,
        created_at: ts_col(row, 12)?,
        updated_at: ts_col(row, 13)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BackfillJob> {
    Ok(BackfillJob {
        id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        timeframe: parse_col(row, 2)?,
        status: parse_col(row, 3)?,
        priority: row.get(4)?,
        total_chunks: count_col(row, 5)?,
        done_chunks: count_col(row, 6)?,
        error_chunks: count_col(row, 7)?,
        progress_pct: row.get(8)?,
        range: Window {
            start: ts_col(row, 9)?,
            end: ts_col(row, 10)?,
        },
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        chunk_id: row.get(2)?,
        symbol: Symbol::new(row.get::<_, String>(3)?),
        timeframe: parse_col(row, 4)?,
        window: Window {
            start: ts_col(row, 5)?,
            end: ts_col(row, 6)?,
        },
        status: parse_col(row, 7)?,
        rows_written: count_col(row, 8)?,
        provider: row.get(9)?,
        error: row.get(10)?,
        duration_ms: count_col(row, 11)?,
        started_at: ts_col(row, 12)?,
    })
}

fn chunk_counts(conn: &Connection, job_id: i64) -> Result<ChunkCounts> {
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'running'), 0),
                COALESCE(SUM(status = 'done'), 0),
                COALESCE(SUM(status = 'error'), 0)
         FROM backfill_chunks WHERE job_id = ?1",
        params![job_id],
        |row| {
            Ok(ChunkCounts {
                total: count_col(row, 0)?,
                pending: count_col(row, 1)?,
                running: count_col(row, 2)?,
                done: count_col(row, 3)?,
                error: count_col(row, 4)?,
            })
        },
    )
    .map_err(store_err)
}

/// Recomputes the aggregate columns of a job from its chunks.
fn refresh_job(conn: &Connection, job_id: i64, now: DateTime<Utc>) -> Result<ChunkCounts> {
    let counts = chunk_counts(conn, job_id)?;
    conn.execute(
        "UPDATE backfill_jobs
         SET status = ?2, total_chunks = ?3, done_chunks = ?4, error_chunks = ?5,
             progress_pct = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            job_id,
            counts.status().as_str(),
            to_sql_count(counts.total),
            to_sql_count(counts.done),
            to_sql_count(counts.error),
            counts.progress_pct(),
            millis(now),
        ],
    )
    .map_err(store_err)?;
    Ok(counts)
}

fn load_job(conn: &Connection, symbol: &Symbol, timeframe: Timeframe) -> Result<Option<BackfillJob>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM backfill_jobs WHERE symbol = ?1 AND timeframe = ?2"),
        params![symbol.as_str(), timeframe.as_str()],
        job_from_row,
    )
    .optional()
    .map_err(store_err)
}

fn scope_params(scope: Option<&ChunkScope>) -> (Option<&str>, Option<&'static str>) {
    scope.map_or((None, None), |s| {
        (Some(s.symbol.as_str()), s.timeframe.map(|tf| tf.as_str()))
    })
}

#[async_trait]
impl JobRepository for SqliteStore {
    #[instrument(skip(self, windows), fields(symbol = %symbol, timeframe = %timeframe, windows = windows.len()))]
    async fn seed_job(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        windows: &[Window],
        priority: i32,
        policy: SeedPolicy,
        now: DateTime<Utc>,
    ) -> Result<SeededJob> {
        let (Some(range_start), Some(range_end)) = (
            windows.iter().map(|w| w.start).min(),
            windows.iter().map(|w| w.end).max(),
        ) else {
            return Err(BackfillError::InvalidParameter(format!(
                "No windows to seed for {symbol} {timeframe}"
            )));
        };

        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let (job_id, job_priority): (i64, i32) = tx
            .query_row(
                "INSERT INTO backfill_jobs
                 (symbol, timeframe, status, priority, range_start, range_end, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (symbol, timeframe) DO UPDATE SET
                    priority = MAX(priority, excluded.priority),
                    range_start = MIN(range_start, excluded.range_start),
                    range_end = MAX(range_end, excluded.range_end),
                    updated_at = excluded.updated_at
                 RETURNING id, priority",
                params![
                    symbol.as_str(),
                    timeframe.as_str(),
                    priority,
                    millis(range_start),
                    millis(range_end),
                    millis(now),
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(store_err)?;

        let mut created = 0usize;
        for window in windows {
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, status FROM backfill_chunks
                     WHERE job_id = ?1 AND window_start = ?2 AND window_end = ?3",
                    params![job_id, millis(window.start), millis(window.end)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(store_err)?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO backfill_chunks
                         (job_id, symbol, timeframe, window_start, window_end, status, priority,
                          available_at, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7, ?7)",
                        params![
                            job_id,
                            symbol.as_str(),
                            timeframe.as_str(),
                            millis(window.start),
                            millis(window.end),
                            job_priority,
                            millis(now),
                        ],
                    )
                    .map_err(store_err)?;
                    created += 1;
                }
                Some((chunk_id, status))
                    if policy == SeedPolicy::ReopenCompleted
                        && status == ChunkStatus::Done.as_str() =>
                {
                    tx.execute(
                        "UPDATE backfill_chunks
                         SET status = 'pending', attempts = 0, last_error = NULL,
                             available_at = ?2, lease_expires_at = NULL, updated_at = ?2
                         WHERE id = ?1",
                        params![chunk_id, millis(now)],
                    )
                    .map_err(store_err)?;
                    created += 1;
                }
                Some(_) => {}
            }
        }

        refresh_job(&tx, job_id, now)?;
        let job = load_job(&tx, symbol, timeframe)?
            .ok_or_else(|| BackfillError::Store(format!("Job {job_id} vanished while seeding")))?;
        tx.commit().map_err(store_err)?;

        debug!(job_id, created, "Seeded backfill job");
        Ok(SeededJob {
            job,
            chunks_created: created,
            chunks_requested: windows.len(),
        })
    }

    #[instrument(skip(self, scope))]
    async fn claim_next_chunk(
        &self,
        scope: Option<&ChunkScope>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkClaim>> {
        let (symbol, timeframe) = scope_params(scope);
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let claim = tx
            .query_row(
                &format!(
                    "UPDATE backfill_chunks
                     SET status = 'running', claims = claims + 1,
                         lease_expires_at = ?2, updated_at = ?1
                     WHERE id = (
                        SELECT id FROM backfill_chunks
                        WHERE ((status = 'pending' AND available_at <= ?1)
                               OR (status = 'running' AND lease_expires_at <= ?1))
                          AND (?3 IS NULL OR symbol = ?3)
                          AND (?4 IS NULL OR timeframe = ?4)
                        ORDER BY priority DESC, available_at ASC, id ASC
                        LIMIT 1
                     )
                     RETURNING {CHUNK_COLUMNS}, claims"
                ),
                params![millis(now), millis(after(now, lease)), symbol, timeframe],
                |row| {
                    Ok(ChunkClaim {
                        chunk: chunk_from_row(row)?,
                        generation: count_col(row, 14)?,
                    })
                },
            )
            .optional()
            .map_err(store_err)?;

        if let Some(claim) = &claim {
            refresh_job(&tx, claim.chunk.job_id, now)?;
        }
        tx.commit().map_err(store_err)?;

        if let Some(claim) = &claim {
            debug!(
                chunk_id = claim.chunk.id,
                generation = claim.generation,
                "Claimed chunk"
            );
        }
        Ok(claim)
    }

    #[instrument(skip(self, claim), fields(chunk_id = claim.chunk.id, generation = claim.generation))]
    async fn complete_chunk(
        &self,
        claim: &ChunkClaim,
        outcome: &ChunkOutcome,
        now: DateTime<Utc>,
    ) -> Result<ChunkTransition> {
        let generation = to_sql_count(claim.generation);
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let current = tx
            .query_row(
                &format!(
                    "SELECT {CHUNK_COLUMNS} FROM backfill_chunks
                     WHERE id = ?1 AND status = 'running' AND claims = ?2"
                ),
                params![claim.chunk.id, generation],
                chunk_from_row,
            )
            .optional()
            .map_err(store_err)?;

        let Some(chunk) = current else {
            warn!("Discarding completion for a chunk that lost its lease");
            return Ok(ChunkTransition::Stale);
        };

        let update = apply_outcome(&self.retry, &chunk, outcome, now);
        tx.execute(
            "UPDATE backfill_chunks
             SET status = ?3, attempts = ?4, last_error = ?5, available_at = ?6,
                 lease_expires_at = NULL, updated_at = ?7
             WHERE id = ?1 AND claims = ?2",
            params![
                chunk.id,
                generation,
                update.status.as_str(),
                update.attempts,
                update.last_error,
                millis(update.available_at),
                millis(now),
            ],
        )
        .map_err(store_err)?;
        refresh_job(&tx, chunk.job_id, now)?;
        tx.commit().map_err(store_err)?;

        debug!(transition = ?update.transition, "Completed chunk");
        Ok(update.transition)
    }

    #[instrument(skip(self, scope))]
    async fn reseed_errored(
        &self,
        scope: Option<&ChunkScope>,
        errored_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let (symbol, timeframe) = scope_params(scope);
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let job_ids = {
            let mut stmt = tx
                .prepare(
                    "UPDATE backfill_chunks
                     SET status = 'pending', attempts = 0, available_at = ?1,
                         lease_expires_at = NULL, updated_at = ?1
                     WHERE status = 'error' AND updated_at < ?2
                       AND (?3 IS NULL OR symbol = ?3)
                       AND (?4 IS NULL OR timeframe = ?4)
                     RETURNING job_id",
                )
                .map_err(store_err)?;
            stmt.query_map(
                params![millis(now), millis(errored_before), symbol, timeframe],
                |row| row.get::<_, i64>(0),
            )
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?
        };

        let reseeded = job_ids.len();
        for job_id in job_ids.into_iter().collect::<BTreeSet<_>>() {
            refresh_job(&tx, job_id, now)?;
        }
        tx.commit().map_err(store_err)?;

        if reseeded > 0 {
            debug!("Reseeded {} errored chunks", reseeded);
        }
        Ok(reseeded)
    }

    async fn job(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Option<BackfillJob>> {
        let conn = self.conn()?;
        load_job(&conn, symbol, timeframe)
    }

    async fn chunks(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<BackfillChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {CHUNK_COLUMNS} FROM backfill_chunks
                 WHERE symbol = ?1 AND timeframe = ?2
                 ORDER BY window_start ASC, id ASC"
            ))
            .map_err(store_err)?;
        let chunks = stmt
            .query_map(params![symbol.as_str(), timeframe.as_str()], chunk_from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        Ok(chunks
            .into_iter()
            .filter(|c| statuses.is_empty() || statuses.contains(&c.status))
            .collect())
    }

    async fn job_progress(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<JobProgress> {
        let conn = self.conn()?;
        let Some(job) = load_job(&conn, symbol, timeframe)? else {
            return Ok(JobProgress {
                symbol: symbol.clone(),
                timeframe: Some(timeframe),
                ..JobProgress::default()
            });
        };

        let counts = chunk_counts(&conn, job.id)?;
        let last_error: Option<String> = conn
            .query_row(
                "SELECT last_error FROM backfill_chunks
                 WHERE job_id = ?1 AND last_error IS NOT NULL
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                params![job.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;

        Ok(JobProgress {
            symbol: symbol.clone(),
            timeframe: Some(timeframe),
            status: Some(counts.status()),
            total: counts.total,
            done: counts.done,
            pending: counts.pending,
            running: counts.running,
            error: counts.error,
            progress_pct: counts.progress_pct(),
            last_error,
        })
    }

    #[instrument(skip(self, run), fields(chunk_id = run.chunk_id, status = %run.status))]
    async fn record_run(&self, run: &JobRun) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_runs
             (job_id, chunk_id, symbol, timeframe, window_start, window_end, status,
              rows_written, provider, error, duration_ms, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.job_id,
                run.chunk_id,
                run.symbol.as_str(),
                run.timeframe.as_str(),
                millis(run.window.start),
                millis(run.window.end),
                run.status.as_str(),
                to_sql_count(run.rows_written),
                run.provider,
                run.error,
                to_sql_count(run.duration_ms),
                millis(run.started_at),
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    async fn runs_since(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {RUN_COLUMNS} FROM job_runs
                 WHERE symbol = ?1 AND timeframe = ?2 AND started_at >= ?3
                 ORDER BY started_at DESC, id DESC"
            ))
            .map_err(store_err)?;
        let runs = stmt
            .query_map(
                params![symbol.as_str(), timeframe.as_str(), millis(since)],
                run_from_row,
            )
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(runs)
    }
}
