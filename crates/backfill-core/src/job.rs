//! Backfill job, chunk, definition and audit types.
//!
//! A [`BackfillJob`] is the unit of intent: "keep this (symbol, timeframe) filled
//! over this range". It is split into [`BackfillChunk`]s, each a bounded provider
//! request that workers claim, execute and report on.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;
use crate::timeframe::Timeframe;
use crate::types::{Symbol, Window};

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the storage string for this status.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = BackfillError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(BackfillError::Parse(format!(
                        concat!("Invalid ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle state of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting to be claimed.
    Pending,
    /// Leased by a worker.
    Running,
    /// Fetched and stored (or confirmed empty).
    Done,
    /// Terminally failed.
    Error,
}

status_strings!(ChunkStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Error => "error",
});

/// Aggregate state of a job, derived from its chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No chunk has started yet.
    Pending,
    /// Some chunks are running or finished, others remain.
    Running,
    /// Every chunk is done.
    Done,
    /// Nothing left to run and at least one chunk errored.
    Error,
}

status_strings!(JobStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Error => "error",
});

impl JobStatus {
    /// Derives a job status from its chunk counts.
    #[must_use]
    pub const fn from_counts(total: u64, pending: u64, running: u64, done: u64, error: u64) -> Self {
        if total > 0 && done == total {
            Self::Done
        } else if pending == 0 && running == 0 && error > 0 {
            Self::Error
        } else if running > 0 || done > 0 || error > 0 {
            Self::Running
        } else {
            Self::Pending
        }
    }
}

/// A backfill job for one (symbol, timeframe).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    /// Job identifier.
    pub id: i64,
    /// Symbol being filled.
    pub symbol: Symbol,
    /// Timeframe being filled.
    pub timeframe: Timeframe,
    /// Derived aggregate status.
    pub status: JobStatus,
    /// Scheduling priority; higher runs first.
    pub priority: i32,
    /// Number of chunks.
    pub total_chunks: u64,
    /// Chunks in `done`.
    pub done_chunks: u64,
    /// Chunks in `error`.
    pub error_chunks: u64,
    /// `done_chunks / total_chunks` as a percentage.
    pub progress_pct: f64,
    /// Union of every chunk window.
    pub range: Window,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// One bounded provider request belonging to a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillChunk {
    /// Chunk identifier.
    pub id: i64,
    /// Owning job.
    pub job_id: i64,
    /// Symbol to fetch.
    pub symbol: Symbol,
    /// Timeframe to fetch.
    pub timeframe: Timeframe,
    /// Window to fetch.
    pub window: Window,
    /// Current state.
    pub status: ChunkStatus,
    /// Inherited from the job.
    pub priority: i32,
    /// Counted (non-deferred) failed executions.
    pub attempts: u32,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Earliest time the chunk may be claimed.
    pub available_at: DateTime<Utc>,
    /// Lease expiry while running.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// A leased chunk handed to exactly one worker.
///
/// The generation fences the lease: a completion carrying an older generation than
/// the chunk's current one is discarded as stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkClaim {
    /// Snapshot of the chunk at claim time.
    pub chunk: BackfillChunk,
    /// Claim counter at the moment of this claim.
    pub generation: u64,
}

/// What a worker observed while executing a chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkOutcome {
    /// Bars were written.
    Succeeded {
        /// Rows inserted or updated.
        rows_written: usize,
    },
    /// Every eligible provider confirmed there is nothing to fetch.
    NoData,
    /// Backpressure; requeue without counting an attempt.
    Deferred {
        /// Delay before the chunk becomes claimable again.
        retry_after: Duration,
    },
    /// The fetch failed.
    Failed {
        /// Whether another attempt may succeed.
        retryable: bool,
        /// Failure message recorded on the chunk.
        message: String,
    },
}

/// The state change applied by completing a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum ChunkTransition {
    /// Chunk is done.
    Done,
    /// Chunk was requeued with backoff.
    Retrying {
        /// Attempts so far.
        attempts: u32,
        /// When the chunk becomes claimable.
        available_at: DateTime<Utc>,
    },
    /// Chunk exhausted its attempts or failed fatally.
    Errored {
        /// Attempts so far.
        attempts: u32,
    },
    /// Chunk was requeued without counting an attempt.
    Deferred {
        /// When the chunk becomes claimable.
        available_at: DateTime<Utc>,
    },
    /// The claim had lost its lease; nothing changed.
    Stale,
}

/// Retry ceiling and exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before a chunk becomes terminal.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "duration_secs")]
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retrying after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// How seeding treats windows that already have a finished chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Leave `done` chunks alone (explicit requests are idempotent).
    KeepCompleted,
    /// Reopen `done` chunks (the scanner found the data missing again).
    ReopenCompleted,
}

/// Result of seeding a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeededJob {
    /// The job after seeding.
    pub job: BackfillJob,
    /// Chunks inserted or reopened by this call.
    pub chunks_created: usize,
    /// Windows passed in.
    pub chunks_requested: usize,
}

/// Restricts claims and scans to one symbol and optionally one timeframe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkScope {
    /// Symbol filter.
    pub symbol: Symbol,
    /// Optional timeframe filter.
    pub timeframe: Option<Timeframe>,
}

impl ChunkScope {
    /// Scope covering every timeframe of a symbol.
    #[must_use]
    pub const fn symbol(symbol: Symbol) -> Self {
        Self {
            symbol,
            timeframe: None,
        }
    }

    /// Scope covering one (symbol, timeframe).
    #[must_use]
    pub const fn series(symbol: Symbol, timeframe: Timeframe) -> Self {
        Self {
            symbol,
            timeframe: Some(timeframe),
        }
    }

    /// Returns true if the (symbol, timeframe) falls inside this scope.
    #[must_use]
    pub fn matches(&self, symbol: &Symbol, timeframe: Timeframe) -> bool {
        &self.symbol == symbol && self.timeframe.is_none_or(|tf| tf == timeframe)
    }
}

/// A recurring coverage definition maintained by the scanner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Definition identifier (0 before first upsert).
    pub id: i64,
    /// Symbol to cover.
    pub symbol: Symbol,
    /// Timeframe to cover.
    pub timeframe: Timeframe,
    /// Disabled definitions are skipped by the scanner.
    pub enabled: bool,
    /// Priority assigned to seeded jobs.
    pub priority: i32,
    /// Trailing trading sessions to keep filled.
    pub lookback_sessions: u32,
    /// Last completed scan.
    pub last_scanned_at: Option<DateTime<Utc>>,
}

impl JobDefinition {
    /// Creates an enabled definition with default priority.
    #[must_use]
    pub const fn new(symbol: Symbol, timeframe: Timeframe, lookback_sessions: u32) -> Self {
        Self {
            id: 0,
            symbol,
            timeframe,
            enabled: true,
            priority: 0,
            lookback_sessions,
            last_scanned_at: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome recorded for one chunk execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Bars were written.
    Succeeded,
    /// Providers confirmed there is nothing to fetch.
    NoData,
    /// The fetch failed.
    Failed,
    /// The worker exceeded its time budget.
    TimedOut,
}

status_strings!(RunStatus {
    Succeeded => "succeeded",
    NoData => "no_data",
    Failed => "failed",
    TimedOut => "timed_out",
});

/// Audit row for one chunk execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    /// Run identifier (0 before insert).
    pub id: i64,
    /// Owning job.
    pub job_id: i64,
    /// Executed chunk.
    pub chunk_id: i64,
    /// Symbol fetched.
    pub symbol: Symbol,
    /// Timeframe fetched.
    pub timeframe: Timeframe,
    /// Window fetched.
    pub window: Window,
    /// Outcome.
    pub status: RunStatus,
    /// Rows written.
    pub rows_written: u64,
    /// Provider whose result was used.
    pub provider: Option<String>,
    /// Failure message.
    pub error: Option<String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Start of execution.
    pub started_at: DateTime<Utc>,
}

/// Progress snapshot for one (symbol, timeframe).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Symbol.
    pub symbol: Symbol,
    /// Timeframe, `None` only for an empty snapshot.
    pub timeframe: Option<Timeframe>,
    /// Job status, `None` when no job exists.
    pub status: Option<JobStatus>,
    /// Total chunks.
    pub total: u64,
    /// Done chunks.
    pub done: u64,
    /// Pending chunks.
    pub pending: u64,
    /// Running chunks.
    pub running: u64,
    /// Errored chunks.
    pub error: u64,
    /// Percent done.
    pub progress_pct: f64,
    /// Most recent chunk error.
    pub last_error: Option<String>,
}

impl JobProgress {
    /// Returns true once no chunk is pending or running.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(10), Duration::from_secs(1800));
        assert_eq!(policy.backoff(100), Duration::from_secs(1800));
    }

    #[test]
    fn test_job_status_from_counts() {
        assert_eq!(JobStatus::from_counts(3, 3, 0, 0, 0), JobStatus::Pending);
        assert_eq!(JobStatus::from_counts(3, 2, 1, 0, 0), JobStatus::Running);
        assert_eq!(JobStatus::from_counts(3, 1, 0, 2, 0), JobStatus::Running);
        assert_eq!(JobStatus::from_counts(3, 0, 0, 3, 0), JobStatus::Done);
        assert_eq!(JobStatus::from_counts(3, 0, 0, 2, 1), JobStatus::Error);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("running".parse::<ChunkStatus>().unwrap(), ChunkStatus::Running);
        assert_eq!(RunStatus::NoData.as_str(), "no_data");
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_scope_matches() {
        let aapl = Symbol::new("AAPL");
        let scope = ChunkScope::symbol(aapl.clone());
        assert!(scope.matches(&aapl, Timeframe::D1));
        assert!(!scope.matches(&Symbol::new("MSFT"), Timeframe::D1));

        let series = ChunkScope::series(aapl.clone(), Timeframe::H1);
        assert!(!series.matches(&aapl, Timeframe::D1));
    }
}
