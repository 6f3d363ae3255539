//! Execution of one claimed chunk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backfill_core::{
    BackfillChunk, BackfillError, Bar, BarStore, ChunkClaim, ChunkOutcome, ChunkTransition,
    JobRepository, JobRun, Result, RunStatus, TradingCalendar,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::router::{FetchOutcome, ProviderRouter};

/// What happened to one chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerReport {
    /// The executed chunk as claimed.
    pub chunk: BackfillChunk,
    /// Provider whose answer decided the outcome.
    pub provider: Option<String>,
    /// Outcome handed to the repository.
    pub outcome: ChunkOutcome,
    /// Resulting state change.
    pub transition: ChunkTransition,
}

impl WorkerReport {
    /// Rows written by this execution.
    #[must_use]
    pub const fn rows_written(&self) -> usize {
        match self.outcome {
            ChunkOutcome::Succeeded { rows_written } => rows_written,
            _ => 0,
        }
    }
}

/// Fetches, normalizes and stores the bars of one chunk, then completes it.
pub struct FetchWorker {
    router: Arc<ProviderRouter>,
    bars: Arc<dyn BarStore>,
    jobs: Arc<dyn JobRepository>,
    calendar: TradingCalendar,
    timeout: Duration,
}

/// Result of the timed part of an execution.
struct Attempt {
    provider: Option<String>,
    outcome: ChunkOutcome,
    run_status: Option<RunStatus>,
}

impl std::fmt::Debug for FetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchWorker")
            .field("router", &self.router)
            .field("calendar", &self.calendar)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FetchWorker {
    /// Creates a worker bounded by `timeout` per chunk.
    #[must_use]
    pub fn new(
        router: Arc<ProviderRouter>,
        bars: Arc<dyn BarStore>,
        jobs: Arc<dyn JobRepository>,
        calendar: TradingCalendar,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            bars,
            jobs,
            calendar,
            timeout,
        }
    }

    /// Executes a claim: route, fetch, normalize, upsert, audit, complete.
    ///
    /// Only repository failures while completing the chunk are returned as errors;
    /// everything that goes wrong upstream becomes the chunk's outcome.
    #[instrument(
        skip(self, claim),
        fields(chunk = claim.chunk.id, symbol = %claim.chunk.symbol, timeframe = %claim.chunk.timeframe)
    )]
    pub async fn execute(&self, claim: ChunkClaim, now: DateTime<Utc>) -> Result<WorkerReport> {
        let started = Instant::now();
        let chunk = &claim.chunk;

        let attempt = match tokio::time::timeout(self.timeout, self.attempt(chunk, now)).await {
            Ok(attempt) => attempt,
            Err(_) => Attempt {
                provider: None,
                outcome: ChunkOutcome::Failed {
                    retryable: true,
                    message: BackfillError::Timeout(self.timeout).to_string(),
                },
                run_status: Some(RunStatus::TimedOut),
            },
        };

        let elapsed = started.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if let Some(status) = attempt.run_status {
            let run = JobRun {
                id: 0,
                job_id: chunk.job_id,
                chunk_id: chunk.id,
                symbol: chunk.symbol.clone(),
                timeframe: chunk.timeframe,
                window: chunk.window,
                status,
                rows_written: match attempt.outcome {
                    ChunkOutcome::Succeeded { rows_written } => rows_written as u64,
                    _ => 0,
                },
                provider: attempt.provider.clone(),
                error: match &attempt.outcome {
                    ChunkOutcome::Failed { message, .. } => Some(message.clone()),
                    _ => None,
                },
                duration_ms,
                started_at: now,
            };
            if let Err(e) = self.jobs.record_run(&run).await {
                warn!(error = %e, "Failed to record job run");
            }
        }

        let completed_at = now + chrono::Duration::from_std(elapsed).unwrap_or_default();
        let transition = self
            .jobs
            .complete_chunk(&claim, &attempt.outcome, completed_at)
            .await?;

        match transition {
            ChunkTransition::Stale => {
                warn!("Chunk lease was lost before completion; result discarded");
            }
            ChunkTransition::Errored { attempts } => {
                warn!(attempts, outcome = ?attempt.outcome, "Chunk failed terminally");
            }
            _ => {
                info!(provider = ?attempt.provider, ?transition, duration_ms, "Chunk complete");
            }
        }

        Ok(WorkerReport {
            chunk: claim.chunk,
            provider: attempt.provider,
            outcome: attempt.outcome,
            transition,
        })
    }

    async fn attempt(&self, chunk: &BackfillChunk, now: DateTime<Utc>) -> Attempt {
        match self
            .router
            .fetch(&chunk.symbol, chunk.timeframe, &chunk.window, now)
            .await
        {
            FetchOutcome::Deferred {
                provider,
                retry_after,
            } => Attempt {
                provider: Some(provider),
                outcome: ChunkOutcome::Deferred { retry_after },
                run_status: None,
            },
            FetchOutcome::NoData { provider } => Attempt {
                provider: Some(provider),
                outcome: ChunkOutcome::NoData,
                run_status: Some(RunStatus::NoData),
            },
            FetchOutcome::Failed { provider, error } => Attempt {
                provider,
                outcome: ChunkOutcome::Failed {
                    retryable: error.is_retryable(),
                    message: error.to_string(),
                },
                run_status: Some(RunStatus::Failed),
            },
            FetchOutcome::Bars { provider, bars } => {
                let received = bars.len();
                let bars = normalize_bars(&self.calendar, chunk, &provider, bars, now);
                debug!(%provider, received, normalized = bars.len(), "Normalized bars");

                if bars.is_empty() {
                    return Attempt {
                        provider: Some(provider),
                        outcome: ChunkOutcome::NoData,
                        run_status: Some(RunStatus::NoData),
                    };
                }

                match self.bars.upsert_bars(&bars).await {
                    Ok(rows_written) => Attempt {
                        provider: Some(provider),
                        outcome: ChunkOutcome::Succeeded { rows_written },
                        run_status: Some(RunStatus::Succeeded),
                    },
                    Err(e) => Attempt {
                        provider: Some(provider),
                        outcome: ChunkOutcome::Failed {
                            retryable: true,
                            message: e.to_string(),
                        },
                        run_status: Some(RunStatus::Failed),
                    },
                }
            }
        }
    }
}

/// Turns raw provider bars into canonical bars for a chunk.
///
/// Invalid bars and bars whose slot falls outside the chunk window are dropped.
/// Bars repeated at the same timestamp keep the last copy. Bars finer than the
/// chunk's timeframe are rolled up per slot: first open, highest high, lowest low,
/// last close, summed volume.
#[must_use]
pub fn normalize_bars(
    calendar: &TradingCalendar,
    chunk: &BackfillChunk,
    provider: &str,
    bars: Vec<Bar>,
    fetched_at: DateTime<Utc>,
) -> Vec<Bar> {
    let timeframe = chunk.timeframe;

    let mut by_timestamp: BTreeMap<DateTime<Utc>, (DateTime<Utc>, Bar)> = BTreeMap::new();
    for bar in bars {
        if !bar.is_valid() {
            continue;
        }
        let Some(slot) = calendar.align(timeframe, bar.timestamp) else {
            continue;
        };
        if chunk.window.contains(slot) {
            by_timestamp.insert(bar.timestamp, (slot, bar));
        }
    }

    let mut by_slot: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
    for (slot, bar) in by_timestamp.into_values() {
        by_slot
            .entry(slot)
            .and_modify(|agg| {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
            })
            .or_insert_with(|| {
                Bar::new(
                    chunk.symbol.clone(),
                    timeframe,
                    slot,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                )
            });
    }

    by_slot
        .into_values()
        .map(|bar| bar.with_provider(provider).with_fetched_at(fetched_at))
        .collect()
}
