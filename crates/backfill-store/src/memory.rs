//! In-memory store implementation.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    AssetClass, BackfillChunk, BackfillError, BackfillJob, Bar, BarStore, ChunkClaim,
    ChunkOutcome, ChunkScope, ChunkStatus, ChunkTransition, CoverageRegistry, JobDefinition,
    JobProgress, JobStatus, JobRepository, JobRun, RateBucket, RateDecision, RateLimiter, Result,
    RetryPolicy, SeedPolicy, SeededJob, Symbol, SymbolRecord, Timeframe, Window,
    precedence_rank,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::lifecycle::{ChunkCounts, after, apply_outcome};

/// Uniqueness key of a stored bar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BarKey {
    symbol: Symbol,
    timeframe: Timeframe,
    timestamp: DateTime<Utc>,
    provider: String,
    is_forecast: bool,
    confidence_bits: u64,
}

impl BarKey {
    fn of(bar: &Bar) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            timestamp: bar.timestamp,
            provider: bar.provider.clone(),
            is_forecast: bar.is_forecast,
            confidence_bits: bar.confidence_key().to_bits(),
        }
    }
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    chunk: BackfillChunk,
    claims: u64,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    symbols: BTreeMap<Symbol, SymbolRecord>,
    bars: HashMap<BarKey, Bar>,
    jobs: BTreeMap<i64, BackfillJob>,
    chunks: BTreeMap<i64, ChunkEntry>,
    definitions: BTreeMap<i64, JobDefinition>,
    buckets: HashMap<String, RateBucket>,
    runs: Vec<JobRun>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn job_id(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<i64> {
        self.jobs
            .values()
            .find(|j| &j.symbol == symbol && j.timeframe == timeframe)
            .map(|j| j.id)
    }

    fn counts(&self, job_id: i64) -> ChunkCounts {
        ChunkCounts::tally(
            self.chunks
                .values()
                .filter(|e| e.chunk.job_id == job_id)
                .map(|e| &e.chunk.status),
        )
    }

    fn refresh_job(&mut self, job_id: i64, now: DateTime<Utc>) {
        let counts = self.counts(job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.status = counts.status();
            job.total_chunks = counts.total;
            job.done_chunks = counts.done;
            job.error_chunks = counts.error;
            job.progress_pct = counts.progress_pct();
            job.updated_at = now;
        }
    }
}

/// Simple in-memory store for testing and single-process runs.
///
/// All state lives behind one `Mutex`, which makes every trait method atomic with
/// respect to other callers in the same process. State is lost when the store is
/// dropped.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    retry: RetryPolicy,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy applied when completing failed chunks.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn in_scope(chunk: &BackfillChunk, scope: Option<&ChunkScope>) -> bool {
    scope.is_none_or(|s| s.matches(&chunk.symbol, chunk.timeframe))
}

#[async_trait]
impl BarStore for InMemoryStore {
    #[instrument(skip(self, bars), fields(count = bars.len()))]
    async fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut state = self.state.lock().await;
        for bar in bars {
            state.bars.insert(BarKey::of(bar), bar.clone());
        }
        debug!("Upserted {} bars", bars.len());
        Ok(bars.len())
    }

    async fn query_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let state = self.state.lock().await;
        let mut best: BTreeMap<DateTime<Utc>, &Bar> = BTreeMap::new();
        for bar in state.bars.values().filter(|b| {
            !b.is_forecast
                && &b.symbol == symbol
                && b.timeframe == timeframe
                && window.contains(b.timestamp)
        }) {
            let rank = |b: &Bar| {
                (
                    Reverse(b.fetched_at),
                    precedence_rank(&b.provider),
                    b.provider.clone(),
                )
            };
            best.entry(bar.timestamp)
                .and_modify(|current| {
                    if rank(bar) < rank(*current) {
                        *current = bar;
                    }
                })
                .or_insert(bar);
        }
        Ok(best.into_values().cloned().collect())
    }

    async fn query_forecasts(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let state = self.state.lock().await;
        let mut bars: Vec<Bar> = state
            .bars
            .values()
            .filter(|b| {
                b.is_forecast
                    && &b.symbol == symbol
                    && b.timeframe == timeframe
                    && window.contains(b.timestamp)
            })
            .cloned()
            .collect();
        bars.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.confidence_key().total_cmp(&b.confidence_key()))
                .then_with(|| a.provider.cmp(&b.provider))
        });
        Ok(bars)
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
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

        let mut state = self.state.lock().await;
        let job_id = match state.job_id(symbol, timeframe) {
            Some(id) => {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.priority = job.priority.max(priority);
                    job.range.start = job.range.start.min(range_start);
                    job.range.end = job.range.end.max(range_end);
                    job.updated_at = now;
                }
                id
            }
            None => {
                let id = state.next_id();
                state.jobs.insert(
                    id,
                    BackfillJob {
                        id,
                        symbol: symbol.clone(),
                        timeframe,
                        status: JobStatus::Pending,
                        priority,
                        total_chunks: 0,
                        done_chunks: 0,
                        error_chunks: 0,
                        progress_pct: 0.0,
                        range: Window {
                            start: range_start,
                            end: range_end,
                        },
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            }
        };
        let job_priority = state.jobs.get(&job_id).map_or(priority, |j| j.priority);

        let mut created = 0usize;
        for window in windows {
            let existing = state
                .chunks
                .values_mut()
                .find(|e| e.chunk.job_id == job_id && e.chunk.window == *window);
            match existing {
                None => {
                    let id = state.next_id();
                    state.chunks.insert(
                        id,
                        ChunkEntry {
                            chunk: BackfillChunk {
                                id,
                                job_id,
                                symbol: symbol.clone(),
                                timeframe,
                                window: *window,
                                status: ChunkStatus::Pending,
                                priority: job_priority,
                                attempts: 0,
                                last_error: None,
                                available_at: now,
                                lease_expires_at: None,
                                created_at: now,
                                updated_at: now,
                            },
                            claims: 0,
                        },
                    );
                    created += 1;
                }
                Some(entry)
                    if policy == SeedPolicy::ReopenCompleted
                        && entry.chunk.status == ChunkStatus::Done =>
                {
                    let chunk = &mut entry.chunk;
                    chunk.status = ChunkStatus::Pending;
                    chunk.attempts = 0;
                    chunk.last_error = None;
                    chunk.available_at = now;
                    chunk.lease_expires_at = None;
                    chunk.updated_at = now;
                    created += 1;
                }
                Some(_) => {}
            }
        }

        state.refresh_job(job_id, now);
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| BackfillError::Store(format!("Job {job_id} vanished while seeding")))?;

        debug!(job_id, created, "Seeded backfill job");
        Ok(SeededJob {
            job,
            chunks_created: created,
            chunks_requested: windows.len(),
        })
    }

    async fn claim_next_chunk(
        &self,
        scope: Option<&ChunkScope>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkClaim>> {
        let mut state = self.state.lock().await;
        let next = state
            .chunks
            .values()
            .filter(|e| in_scope(&e.chunk, scope))
            .filter(|e| match e.chunk.status {
                ChunkStatus::Pending => e.chunk.available_at <= now,
                ChunkStatus::Running => e.chunk.lease_expires_at.is_some_and(|l| l <= now),
                ChunkStatus::Done | ChunkStatus::Error => false,
            })
            .min_by_key(|e| (Reverse(e.chunk.priority), e.chunk.available_at, e.chunk.id))
            .map(|e| e.chunk.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.chunks.get_mut(&id) else {
            return Ok(None);
        };
        entry.claims += 1;
        entry.chunk.status = ChunkStatus::Running;
        entry.chunk.lease_expires_at = Some(after(now, lease));
        entry.chunk.updated_at = now;
        let claim = ChunkClaim {
            chunk: entry.chunk.clone(),
            generation: entry.claims,
        };
        state.refresh_job(claim.chunk.job_id, now);

        debug!(chunk_id = id, generation = claim.generation, "Claimed chunk");
        Ok(Some(claim))
    }

    async fn complete_chunk(
        &self,
        claim: &ChunkClaim,
        outcome: &ChunkOutcome,
        now: DateTime<Utc>,
    ) -> Result<ChunkTransition> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.chunks.get_mut(&claim.chunk.id).filter(|e| {
            e.chunk.status == ChunkStatus::Running && e.claims == claim.generation
        }) else {
            warn!(
                chunk_id = claim.chunk.id,
                "Discarding completion for a chunk that lost its lease"
            );
            return Ok(ChunkTransition::Stale);
        };

        let update = apply_outcome(&self.retry, &entry.chunk, outcome, now);
        entry.chunk.status = update.status;
        entry.chunk.attempts = update.attempts;
        entry.chunk.last_error = update.last_error;
        entry.chunk.available_at = update.available_at;
        entry.chunk.lease_expires_at = None;
        entry.chunk.updated_at = now;
        let job_id = entry.chunk.job_id;
        state.refresh_job(job_id, now);

        Ok(update.transition)
    }

    async fn reseed_errored(
        &self,
        scope: Option<&ChunkScope>,
        errored_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut jobs = Vec::new();
        for entry in state.chunks.values_mut().filter(|e| {
            e.chunk.status == ChunkStatus::Error
                && e.chunk.updated_at < errored_before
                && in_scope(&e.chunk, scope)
        }) {
            entry.chunk.status = ChunkStatus::Pending;
            entry.chunk.attempts = 0;
            entry.chunk.available_at = now;
            entry.chunk.lease_expires_at = None;
            entry.chunk.updated_at = now;
            jobs.push(entry.chunk.job_id);
        }

        let reseeded = jobs.len();
        jobs.sort_unstable();
        jobs.dedup();
        for job_id in jobs {
            state.refresh_job(job_id, now);
        }
        Ok(reseeded)
    }

    async fn job(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Option<BackfillJob>> {
        let state = self.state.lock().await;
        Ok(state
            .job_id(symbol, timeframe)
            .and_then(|id| state.jobs.get(&id).cloned()))
    }

    async fn chunks(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<BackfillChunk>> {
        let state = self.state.lock().await;
        let mut chunks: Vec<BackfillChunk> = state
            .chunks
            .values()
            .map(|e| &e.chunk)
            .filter(|c| &c.symbol == symbol && c.timeframe == timeframe)
            .filter(|c| statuses.is_empty() || statuses.contains(&c.status))
            .cloned()
            .collect();
        chunks.sort_by_key(|c| (c.window.start, c.id));
        Ok(chunks)
    }

    async fn job_progress(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<JobProgress> {
        let state = self.state.lock().await;
        let Some(job_id) = state.job_id(symbol, timeframe) else {
            return Ok(JobProgress {
                symbol: symbol.clone(),
                timeframe: Some(timeframe),
                ..JobProgress::default()
            });
        };

        let counts = state.counts(job_id);
        let last_error = state
            .chunks
            .values()
            .map(|e| &e.chunk)
            .filter(|c| c.job_id == job_id && c.last_error.is_some())
            .max_by_key(|c| (c.updated_at, c.id))
            .and_then(|c| c.last_error.clone());

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

    async fn record_run(&self, run: &JobRun) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.runs.push(JobRun { id, ..run.clone() });
        Ok(id)
    }

    async fn runs_since(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<JobRun> = state
            .runs
            .iter()
            .filter(|r| &r.symbol == symbol && r.timeframe == timeframe && r.started_at >= since)
            .cloned()
            .collect();
        runs.sort_by_key(|r| Reverse((r.started_at, r.id)));
        Ok(runs)
    }
}

#[async_trait]
impl CoverageRegistry for InMemoryStore {
    async fn register_symbol(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        now: DateTime<Utc>,
    ) -> Result<SymbolRecord> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.symbols.get(symbol) {
            return Ok(record.clone());
        }
        let record = SymbolRecord {
            id: state.next_id(),
            symbol: symbol.clone(),
            asset_class,
            created_at: now,
        };
        state.symbols.insert(symbol.clone(), record.clone());
        Ok(record)
    }

    async fn symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>> {
        Ok(self.state.lock().await.symbols.get(symbol).cloned())
    }

    async fn upsert_definition(
        &self,
        definition: &JobDefinition,
        _now: DateTime<Utc>,
    ) -> Result<JobDefinition> {
        let mut state = self.state.lock().await;
        let existing = state
            .definitions
            .values_mut()
            .find(|d| d.symbol == definition.symbol && d.timeframe == definition.timeframe);
        if let Some(stored) = existing {
            stored.enabled = definition.enabled;
            stored.priority = definition.priority;
            stored.lookback_sessions = definition.lookback_sessions;
            return Ok(stored.clone());
        }

        let stored = JobDefinition {
            id: state.next_id(),
            ..definition.clone()
        };
        state.definitions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn definitions(&self, enabled_only: bool) -> Result<Vec<JobDefinition>> {
        let state = self.state.lock().await;
        let mut definitions: Vec<JobDefinition> = state
            .definitions
            .values()
            .filter(|d| !enabled_only || d.enabled)
            .cloned()
            .collect();
        definitions.sort_by_key(|d| (Reverse(d.priority), d.id));
        Ok(definitions)
    }

    async fn mark_scanned(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let definition = state.definitions.get_mut(&id).ok_or_else(|| {
            BackfillError::InvalidParameter(format!("Unknown job definition: {id}"))
        })?;
        definition.last_scanned_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for InMemoryStore {
    async fn configure_bucket(
        &self,
        provider: &str,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> Result<RateBucket> {
        if !(capacity > 0.0 && refill_per_sec >= 0.0) {
            return Err(BackfillError::InvalidParameter(format!(
                "Invalid rate bucket for {provider}: capacity {capacity}, refill {refill_per_sec}/s"
            )));
        }
        let mut state = self.state.lock().await;
        let bucket = state
            .buckets
            .entry(provider.to_string())
            .and_modify(|b| {
                b.capacity = capacity;
                b.refill_per_sec = refill_per_sec;
                b.tokens = b.tokens.min(capacity);
            })
            .or_insert_with(|| RateBucket::new(provider, capacity, refill_per_sec, now));
        Ok(bucket.clone())
    }

    async fn acquire(&self, provider: &str, cost: f64, now: DateTime<Utc>) -> Result<RateDecision> {
        let mut state = self.state.lock().await;
        let bucket = state
            .buckets
            .get_mut(provider)
            .ok_or_else(|| BackfillError::ProviderNotConfigured(provider.to_string()))?;
        Ok(bucket.try_acquire(cost, now))
    }

    async fn bucket(&self, provider: &str) -> Result<Option<RateBucket>> {
        Ok(self.state.lock().await.buckets.get(provider).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::TimeZone;

    const LEASE: Duration = Duration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn window(days_back: i64) -> Window {
        let start = t0() - chrono::Duration::days(days_back);
        Window::new(start, start + chrono::Duration::days(1)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryStore::new());
        let symbol = Symbol::new("AAPL");
        store
            .seed_job(
                &symbol,
                Timeframe::D1,
                &[window(3), window(2), window(1)],
                0,
                SeedPolicy::KeepCompleted,
                t0(),
            )
            .await
            .unwrap();

        let claims = futures::future::join_all((0..10).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_next_chunk(None, LEASE, t0()).await })
        }))
        .await;

        let results: Vec<Option<ChunkClaim>> =
            claims.into_iter().map(|r| r.unwrap().unwrap()).collect();
        let ids: Vec<i64> = results.iter().flatten().map(|c| c.chunk.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 7);
        let distinct: std::collections::HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_completion_is_discarded() {
        let store = InMemoryStore::new();
        let symbol = Symbol::new("AAPL");
        store
            .seed_job(&symbol, Timeframe::D1, &[window(1)], 0, SeedPolicy::KeepCompleted, t0())
            .await
            .unwrap();

        let first = store.claim_next_chunk(None, LEASE, t0()).await.unwrap().unwrap();
        let later = t0() + chrono::Duration::seconds(61);
        let second = store.claim_next_chunk(None, LEASE, later).await.unwrap().unwrap();

        let stale = store
            .complete_chunk(&first, &ChunkOutcome::NoData, later)
            .await
            .unwrap();
        assert_eq!(stale, ChunkTransition::Stale);

        let done = store
            .complete_chunk(&second, &ChunkOutcome::NoData, later)
            .await
            .unwrap();
        assert_eq!(done, ChunkTransition::Done);
    }

    #[tokio::test]
    async fn test_query_bars_dedupes_by_timestamp() {
        let store = InMemoryStore::new();
        let symbol = Symbol::new("AAPL");
        let ts = t0() - chrono::Duration::days(1);
        let bar = |provider: &str, close: f64| {
            Bar::new(symbol.clone(), Timeframe::D1, ts, close, close, close, close, 1.0)
                .with_provider(provider)
                .with_fetched_at(t0())
        };
        store
            .upsert_bars(&[bar("yahoo", 1.0), bar("polygon", 2.0), bar("yahoo", 1.5)])
            .await
            .unwrap();

        let bars = store
            .query_bars(&symbol, Timeframe::D1, &window(1))
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].provider, "polygon");
    }

    #[tokio::test]
    async fn test_rate_bucket() {
        let store = InMemoryStore::new();
        store.configure_bucket("tradier", 2.0, 0.5, t0()).await.unwrap();
        assert!(store.acquire("tradier", 1.0, t0()).await.unwrap().is_granted());
        assert!(store.acquire("tradier", 1.0, t0()).await.unwrap().is_granted());
        assert_eq!(
            store.acquire("tradier", 1.0, t0()).await.unwrap(),
            RateDecision::Denied {
                retry_after: Duration::from_secs(2)
            }
        );
        assert!(store.acquire("unknown", 1.0, t0()).await.is_err());
    }
}
