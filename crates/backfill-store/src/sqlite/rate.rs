use async_trait::async_trait;
use backfill_core::{BackfillError, RateBucket, RateDecision, RateLimiter, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, instrument};

use super::{SqliteStore, epoch_secs, secs_col, store_err};

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<RateBucket> {
    Ok(RateBucket {
        provider: row.get(0)?,
        capacity: row.get(1)?,
        tokens: row.get(2)?,
        refill_per_sec: row.get(3)?,
        last_refill: secs_col(row, 4)?,
    })
}

#[async_trait]
impl RateLimiter for SqliteStore {
    #[instrument(skip(self))]
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

        let conn = self.conn()?;
        conn.query_row(
            "INSERT INTO rate_buckets (provider, capacity, tokens, refill_per_sec, last_refill)
             VALUES (?1, ?2, ?2, ?3, ?4)
             ON CONFLICT (provider) DO UPDATE SET
                capacity = excluded.capacity,
                refill_per_sec = excluded.refill_per_sec,
                tokens = MIN(tokens, excluded.capacity)
             RETURNING provider, capacity, tokens, refill_per_sec, last_refill",
            params![provider, capacity, refill_per_sec, epoch_secs(now)],
            bucket_from_row,
        )
        .map_err(store_err)
    }

    #[instrument(skip(self))]
    async fn acquire(&self, provider: &str, cost: f64, now: DateTime<Utc>) -> Result<RateDecision> {
        let conn = self.conn()?;
        let granted: Option<f64> = conn
            .query_row(
                "UPDATE rate_buckets
                 SET tokens = MIN(capacity, tokens + MAX(0.0, ?2 - last_refill) * refill_per_sec) - ?3,
                     last_refill = MAX(last_refill, ?2)
                 WHERE provider = ?1
                   AND MIN(capacity, tokens + MAX(0.0, ?2 - last_refill) * refill_per_sec) >= ?3
                 RETURNING tokens",
                params![provider, epoch_secs(now), cost],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;

        if let Some(remaining) = granted {
            return Ok(RateDecision::Granted { remaining });
        }

        let bucket = conn
            .query_row(
                "SELECT provider, capacity, tokens, refill_per_sec, last_refill
                 FROM rate_buckets WHERE provider = ?1",
                params![provider],
                bucket_from_row,
            )
            .optional()
            .map_err(store_err)?
            .ok_or_else(|| BackfillError::ProviderNotConfigured(provider.to_string()))?;

        let retry_after = bucket.refilled(now).time_until(cost);
        debug!(?retry_after, "Rate limit reached");
        Ok(RateDecision::Denied { retry_after })
    }

    async fn bucket(&self, provider: &str) -> Result<Option<RateBucket>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT provider, capacity, tokens, refill_per_sec, last_refill
             FROM rate_buckets WHERE provider = ?1",
            params![provider],
            bucket_from_row,
        )
        .optional()
        .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_bucket_grants_capacity_then_refills() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.configure_bucket("polygon", 5.0, 1.0, t0()).await.unwrap();

        let decisions = futures::future::join_all((0..6).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.acquire("polygon", 1.0, t0()).await })
        }))
        .await;
        let granted = decisions
            .into_iter()
            .filter(|d| d.as_ref().unwrap().as_ref().unwrap().is_granted())
            .count();
        assert_eq!(granted, 5);

        match store.acquire("polygon", 1.0, t0()).await.unwrap() {
            RateDecision::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let later = t0() + chrono::Duration::seconds(1);
        assert!(store.acquire("polygon", 1.0, later).await.unwrap().is_granted());
        assert!(!store.acquire("polygon", 1.0, later).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_error() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.acquire("nobody", 1.0, t0()).await.unwrap_err();
        assert!(matches!(err, BackfillError::ProviderNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_reconfigure_clamps_tokens() {
        let store = SqliteStore::in_memory().unwrap();
        store.configure_bucket("yahoo", 10.0, 1.0, t0()).await.unwrap();
        let bucket = store.configure_bucket("yahoo", 3.0, 0.5, t0()).await.unwrap();
        assert_eq!(bucket.capacity, 3.0);
        assert_eq!(bucket.tokens, 3.0);
    }
}
