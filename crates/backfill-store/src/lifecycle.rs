//! Chunk state transitions shared by every store backend.

use std::time::Duration;

use backfill_core::{
    BackfillChunk, ChunkOutcome, ChunkStatus, ChunkTransition, JobStatus, RetryPolicy,
};
use chrono::{DateTime, Utc};

/// New chunk columns produced by applying an outcome.
#[derive(Debug)]
pub(crate) struct ChunkUpdate {
    pub(crate) status: ChunkStatus,
    pub(crate) attempts: u32,
    pub(crate) available_at: DateTime<Utc>,
    pub(crate) last_error: Option<String>,
    pub(crate) transition: ChunkTransition,
}

/// Applies a worker outcome to a running chunk.
///
/// Deferrals never count as attempts and wait at most `max_backoff`; retryable
/// failures back off exponentially until `max_attempts`, after which the chunk
/// is terminal.
pub(crate) fn apply_outcome(
    policy: &RetryPolicy,
    chunk: &BackfillChunk,
    outcome: &ChunkOutcome,
    now: DateTime<Utc>,
) -> ChunkUpdate {
    match outcome {
        ChunkOutcome::Succeeded { .. } | ChunkOutcome::NoData => ChunkUpdate {
            status: ChunkStatus::Done,
            attempts: chunk.attempts,
            available_at: chunk.available_at,
            last_error: None,
            transition: ChunkTransition::Done,
        },
        ChunkOutcome::Deferred { retry_after } => {
            let available_at = after(now, (*retry_after).min(policy.max_backoff));
            ChunkUpdate {
                status: ChunkStatus::Pending,
                attempts: chunk.attempts,
                available_at,
                last_error: chunk.last_error.clone(),
                transition: ChunkTransition::Deferred { available_at },
            }
        }
        ChunkOutcome::Failed { retryable, message } => {
            let attempts = chunk.attempts.saturating_add(1);
            if *retryable && attempts < policy.max_attempts {
                let available_at = after(now, policy.backoff(attempts));
                ChunkUpdate {
                    status: ChunkStatus::Pending,
                    attempts,
                    available_at,
                    last_error: Some(message.clone()),
                    transition: ChunkTransition::Retrying {
                        attempts,
                        available_at,
                    },
                }
            } else {
                ChunkUpdate {
                    status: ChunkStatus::Error,
                    attempts,
                    available_at: chunk.available_at,
                    last_error: Some(message.clone()),
                    transition: ChunkTransition::Errored { attempts },
                }
            }
        }
    }
}

/// Chunk counts of one job.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ChunkCounts {
    pub(crate) total: u64,
    pub(crate) pending: u64,
    pub(crate) running: u64,
    pub(crate) done: u64,
    pub(crate) error: u64,
}

impl ChunkCounts {
    pub(crate) fn tally<'a>(statuses: impl IntoIterator<Item = &'a ChunkStatus>) -> Self {
        statuses.into_iter().fold(Self::default(), |mut c, s| {
            c.total += 1;
            match s {
                ChunkStatus::Pending => c.pending += 1,
                ChunkStatus::Running => c.running += 1,
                ChunkStatus::Done => c.done += 1,
                ChunkStatus::Error => c.error += 1,
            }
            c
        })
    }

    pub(crate) const fn status(&self) -> JobStatus {
        JobStatus::from_counts(self.total, self.pending, self.running, self.done, self.error)
    }

    pub(crate) fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.done as f64 / self.total as f64 * 100.0;
        pct
    }
}

/// Returns `now + delay`, saturating at the maximum representable instant.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::{Symbol, Timeframe, Window};
    use chrono::TimeZone;

    fn running_chunk(attempts: u32, now: DateTime<Utc>) -> BackfillChunk {
        BackfillChunk {
            id: 1,
            job_id: 1,
            symbol: Symbol::new("AAPL"),
            timeframe: Timeframe::D1,
            window: Window::new(now - chrono::Duration::days(1), now).unwrap(),
            status: ChunkStatus::Running,
            priority: 0,
            attempts,
            last_error: None,
            available_at: now,
            lease_expires_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_retry_then_terminal() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let failed = ChunkOutcome::Failed {
            retryable: true,
            message: "503".into(),
        };

        let first = apply_outcome(&policy, &running_chunk(0, now), &failed, now);
        assert_eq!(first.status, ChunkStatus::Pending);
        assert_eq!(first.available_at, now + chrono::Duration::seconds(30));

        let second = apply_outcome(&policy, &running_chunk(1, now), &failed, now);
        assert_eq!(second.status, ChunkStatus::Error);
        assert_eq!(second.transition, ChunkTransition::Errored { attempts: 2 });
    }

    #[test]
    fn test_deferral_keeps_attempts() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let update = apply_outcome(
            &RetryPolicy::default(),
            &running_chunk(3, now),
            &ChunkOutcome::Deferred {
                retry_after: Duration::from_secs(5),
            },
            now,
        );
        assert_eq!(update.status, ChunkStatus::Pending);
        assert_eq!(update.attempts, 3);
    }

    #[test]
    fn test_deferral_is_capped_at_max_backoff() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let policy = RetryPolicy::default();
        let update = apply_outcome(
            &policy,
            &running_chunk(0, now),
            &ChunkOutcome::Deferred {
                retry_after: Duration::MAX,
            },
            now,
        );
        assert_eq!(update.status, ChunkStatus::Pending);
        assert_eq!(update.available_at, after(now, policy.max_backoff));
        assert!(update.available_at < DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_fatal_is_terminal_immediately() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let update = apply_outcome(
            &RetryPolicy::default(),
            &running_chunk(0, now),
            &ChunkOutcome::Failed {
                retryable: false,
                message: "401".into(),
            },
            now,
        );
        assert_eq!(update.status, ChunkStatus::Error);
        assert_eq!(update.attempts, 1);
    }
}
