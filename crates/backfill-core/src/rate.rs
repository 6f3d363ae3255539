//! Token bucket state shared by every rate limiter backend.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent token bucket for one provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateBucket {
    /// Provider identifier.
    pub provider: String,
    /// Maximum tokens.
    pub capacity: f64,
    /// Tokens available at `last_refill`.
    pub tokens: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Instant the token count was last brought up to date.
    pub last_refill: DateTime<Utc>,
}

impl RateBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    /// Returns the bucket with tokens refilled up to `now`.
    ///
    /// A `now` earlier than `last_refill` adds nothing and never moves the clock back.
    #[must_use]
    pub fn refilled(&self, now: DateTime<Utc>) -> Self {
        let elapsed = elapsed_secs(self.last_refill, now);
        Self {
            tokens: (self.tokens + elapsed * self.refill_per_sec).min(self.capacity),
            last_refill: self.last_refill.max(now),
            ..self.clone()
        }
    }

    /// Takes `cost` tokens if available after refilling.
    pub fn try_acquire(&mut self, cost: f64, now: DateTime<Utc>) -> RateDecision {
        *self = self.refilled(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            RateDecision::Granted {
                remaining: self.tokens,
            }
        } else {
            RateDecision::Denied {
                retry_after: self.time_until(cost),
            }
        }
    }

    /// Time until `cost` tokens will be available, assuming an up-to-date bucket.
    #[must_use]
    pub fn time_until(&self, cost: f64) -> Duration {
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 || cost > self.capacity {
            return Duration::MAX;
        }
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}

/// Result of asking a rate limiter for tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateDecision {
    /// Tokens were taken.
    Granted {
        /// Tokens left after the grant.
        remaining: f64,
    },
    /// Not enough tokens; nothing was taken.
    Denied {
        /// Time until enough tokens will have accrued.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Returns true if tokens were granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds().max(0);
    // Millisecond precision is all the stores keep.
    #[allow(clippy::cast_precision_loss)]
    let secs = millis as f64 / 1000.0;
    secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_refill_and_deny() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut bucket = RateBucket::new("polygon", 5.0, 1.0, t0);

        for _ in 0..5 {
            assert!(bucket.try_acquire(1.0, t0).is_granted());
        }
        match bucket.try_acquire(1.0, t0) {
            RateDecision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(1)),
            other => panic!("expected denial, got {other:?}"),
        }

        let later = t0 + chrono::Duration::seconds(1);
        assert!(bucket.try_acquire(1.0, later).is_granted());
        assert!(!bucket.try_acquire(1.0, later).is_granted());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let bucket = RateBucket {
            tokens: 0.0,
            ..RateBucket::new("yahoo", 2.0, 1.0, t0)
        };
        let later = bucket.refilled(t0 + chrono::Duration::hours(1));
        assert_eq!(later.tokens, 2.0);

        let earlier = bucket.refilled(t0 - chrono::Duration::seconds(10));
        assert_eq!(earlier.tokens, 0.0);
        assert_eq!(earlier.last_refill, t0);
    }
}
