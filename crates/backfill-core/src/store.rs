//! Storage traits for bars, jobs, coverage definitions and rate limits.
//!
//! This module defines the persistence seams of the engine:
//!
//! - [`BarStore`] - Idempotent bar upserts and deduplicated reads
//! - [`JobRepository`] - Job seeding, atomic chunk claims and completion
//! - [`CoverageRegistry`] - Symbol registry and recurring job definitions
//! - [`RateLimiter`] - Token buckets shared by every worker
//!
//! Every method that depends on the current time takes it as `now`, so callers
//! (and tests) control the clock. Implementations must make each call atomic with
//! respect to concurrent callers in any process sharing the same store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    job::{
        BackfillChunk, BackfillJob, ChunkClaim, ChunkOutcome, ChunkScope, ChunkStatus,
        ChunkTransition, JobDefinition, JobProgress, JobRun, SeedPolicy, SeededJob,
    },
    rate::{RateBucket, RateDecision},
    timeframe::Timeframe,
    types::{AssetClass, Bar, Symbol, SymbolRecord, Window},
};

/// Durable OHLCV storage.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Inserts or updates bars by their uniqueness key.
    ///
    /// Historical rows are keyed by (symbol, timeframe, timestamp, provider); forecast
    /// rows additionally by confidence. Re-writing a key replaces prices, volume and
    /// fetch time. Returns the number of rows written.
    async fn upsert_bars(&self, bars: &[Bar]) -> Result<usize>;

    /// Returns historical bars in `window`, one per timestamp, ascending.
    ///
    /// When several providers wrote the same slot the most recently fetched row wins,
    /// with [`PROVIDER_PRECEDENCE`](crate::provider::PROVIDER_PRECEDENCE) breaking ties.
    async fn query_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>>;

    /// Returns forecast rows in `window`, ascending by timestamp then confidence.
    async fn query_forecasts(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>>;
}

/// Job and chunk lifecycle, including the claim protocol.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Creates or extends the job for (symbol, timeframe) with one chunk per window.
    ///
    /// Windows that already have a chunk are not duplicated. Existing `done` chunks
    /// are reopened only under [`SeedPolicy::ReopenCompleted`]; `running` chunks are
    /// never touched.
    async fn seed_job(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        windows: &[Window],
        priority: i32,
        policy: SeedPolicy,
        now: DateTime<Utc>,
    ) -> Result<SeededJob>;

    /// Atomically leases the next runnable chunk.
    ///
    /// Runnable means `pending` with `available_at <= now`, or `running` with an
    /// expired lease. Highest priority wins, then earliest `available_at`. No chunk
    /// is ever handed to two concurrent claimers.
    async fn claim_next_chunk(
        &self,
        scope: Option<&ChunkScope>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkClaim>>;

    /// Applies a worker outcome to a claimed chunk and refreshes its job.
    ///
    /// Returns [`ChunkTransition::Stale`] without changing anything if the chunk has
    /// been re-claimed or finished since `claim` was issued.
    async fn complete_chunk(
        &self,
        claim: &ChunkClaim,
        outcome: &ChunkOutcome,
        now: DateTime<Utc>,
    ) -> Result<ChunkTransition>;

    /// Returns `error` chunks last updated before `errored_before` to `pending` with
    /// a fresh attempt budget. Returns the number reseeded.
    async fn reseed_errored(
        &self,
        scope: Option<&ChunkScope>,
        errored_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Returns the job for (symbol, timeframe), if any.
    async fn job(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Option<BackfillJob>>;

    /// Returns the chunks of a job in the given states (all states if empty),
    /// ordered by window start.
    async fn chunks(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<BackfillChunk>>;

    /// Returns a progress snapshot for (symbol, timeframe).
    async fn job_progress(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<JobProgress>;

    /// Appends an execution audit row and returns its id.
    async fn record_run(&self, run: &JobRun) -> Result<i64>;

    /// Returns runs for (symbol, timeframe) started at or after `since`, newest first.
    async fn runs_since(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobRun>>;
}

/// Symbol registry and recurring coverage definitions.
#[async_trait]
pub trait CoverageRegistry: Send + Sync {
    /// Registers a symbol, returning the existing record if already present.
    async fn register_symbol(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        now: DateTime<Utc>,
    ) -> Result<SymbolRecord>;

    /// Looks up a registered symbol.
    async fn symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>>;

    /// Inserts or updates the definition for (symbol, timeframe), returning it with
    /// its stable id. `last_scanned_at` of an existing definition is preserved.
    async fn upsert_definition(
        &self,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<JobDefinition>;

    /// Returns definitions ordered by priority (descending) then id.
    async fn definitions(&self, enabled_only: bool) -> Result<Vec<JobDefinition>>;

    /// Records that a definition was scanned at `at`.
    async fn mark_scanned(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// Persistent token-bucket rate limiting keyed by provider.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Creates a full bucket or updates the shape of an existing one.
    ///
    /// Existing token counts are kept (clamped to the new capacity).
    async fn configure_bucket(
        &self,
        provider: &str,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> Result<RateBucket>;

    /// Atomically refills and takes `cost` tokens.
    ///
    /// # Errors
    /// Returns [`BackfillError::ProviderNotConfigured`](crate::error::BackfillError::ProviderNotConfigured)
    /// if no bucket exists for `provider`.
    async fn acquire(&self, provider: &str, cost: f64, now: DateTime<Utc>)
    -> Result<RateDecision>;

    /// Returns the stored bucket for `provider`.
    async fn bucket(&self, provider: &str) -> Result<Option<RateBucket>>;
}

/// A store implementing every persistence seam.
pub trait BackfillStore: BarStore + JobRepository + CoverageRegistry + RateLimiter {}

impl<T> BackfillStore for T where T: BarStore + JobRepository + CoverageRegistry + RateLimiter {}
