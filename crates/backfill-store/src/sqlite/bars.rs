use async_trait::async_trait;
use backfill_core::{Bar, BarStore, PROVIDER_PRECEDENCE, Result, Symbol, Timeframe, Window};
use rusqlite::{Row, params};
use tracing::{debug, instrument};

use super::{SqliteStore, millis, parse_col, store_err, ts_col};

const BAR_COLUMNS: &str = "symbol, timeframe, ts, provider, open, high, low, close, volume, \
                           is_intraday, is_forecast, confidence, fetched_at";

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<Bar> {
    Ok(Bar {
        symbol: Symbol::new(row.get::<_, String>(0)?),
        timeframe: parse_col(row, 1)?,
        timestamp: ts_col(row, 2)?,
        provider: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
        is_intraday: row.get(9)?,
        is_forecast: row.get(10)?,
        confidence: row.get(11)?,
        fetched_at: ts_col(row, 12)?,
    })
}

/// `CASE` expression ranking providers by read precedence.
fn precedence_case() -> String {
    let arms: String = PROVIDER_PRECEDENCE
        .iter()
        .enumerate()
        .map(|(rank, provider)| format!("WHEN '{provider}' THEN {rank} "))
        .collect();
    format!("CASE provider {arms}ELSE {} END", PROVIDER_PRECEDENCE.len())
}

#[async_trait]
impl BarStore for SqliteStore {
    #[instrument(skip(self, bars), fields(count = bars.len()))]
    async fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(store_err)?;
        let mut written = 0usize;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO bars
                     (symbol, timeframe, ts, provider, open, high, low, close, volume,
                      is_intraday, is_forecast, confidence, confidence_key, fetched_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT (symbol, timeframe, ts, provider, is_forecast, confidence_key)
                     DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume,
                        is_intraday = excluded.is_intraday,
                        confidence = excluded.confidence,
                        fetched_at = excluded.fetched_at",
                )
                .map_err(store_err)?;

            for bar in bars {
                written += stmt
                    .execute(params![
                        bar.symbol.as_str(),
                        bar.timeframe.as_str(),
                        millis(bar.timestamp),
                        bar.provider,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.is_intraday,
                        bar.is_forecast,
                        bar.confidence,
                        bar.confidence_key(),
                        millis(bar.fetched_at),
                    ])
                    .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)?;

        debug!("Upserted {} bars", written);
        Ok(written)
    }

    #[instrument(skip(self), fields(symbol = %symbol, timeframe = %timeframe))]
    async fn query_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let sql = format!(
            "SELECT {BAR_COLUMNS} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY ts
                    ORDER BY fetched_at DESC, {precedence}, provider
                ) AS rn
                FROM bars
                WHERE symbol = ?1 AND timeframe = ?2 AND is_forecast = 0
                  AND ts >= ?3 AND ts < ?4
             )
             WHERE rn = 1
             ORDER BY ts ASC",
            precedence = precedence_case(),
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql).map_err(store_err)?;
        let bars = stmt
            .query_map(
                params![
                    symbol.as_str(),
                    timeframe.as_str(),
                    millis(window.start),
                    millis(window.end)
                ],
                bar_from_row,
            )
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        debug!("Found {} stored bars", bars.len());
        Ok(bars)
    }

    #[instrument(skip(self), fields(symbol = %symbol, timeframe = %timeframe))]
    async fn query_forecasts(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let sql = format!(
            "SELECT {BAR_COLUMNS} FROM bars
             WHERE symbol = ?1 AND timeframe = ?2 AND is_forecast = 1
               AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC, confidence_key ASC, provider ASC"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql).map_err(store_err)?;
        let bars = stmt
            .query_map(
                params![
                    symbol.as_str(),
                    timeframe.as_str(),
                    millis(window.start),
                    millis(window.end)
                ],
                bar_from_row,
            )
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    fn bar(d: u32, provider: &str, close: f64, fetched: DateTime<Utc>) -> Bar {
        Bar::new(Symbol::new("AAPL"), Timeframe::D1, day(d), close, close, close, close, 1.0)
            .with_provider(provider)
            .with_fetched_at(fetched)
    }

    #[tokio::test]
    async fn test_sqlite_store_initialization() {
        let store = SqliteStore::in_memory();
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let bars = vec![bar(4, "yahoo", 10.0, day(10)), bar(5, "yahoo", 11.0, day(10))];

        store.upsert_bars(&bars).await.unwrap();
        store.upsert_bars(&bars).await.unwrap();

        let window = Window::new(day(1), day(9)).unwrap();
        let stored = store
            .query_bars(&Symbol::new("AAPL"), Timeframe::D1, &window)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].close, 11.0);
    }

    #[tokio::test]
    async fn test_read_prefers_latest_then_precedence() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_bars(&[
                bar(4, "yahoo", 10.0, day(20)),
                bar(4, "polygon", 10.5, day(10)),
                bar(5, "yahoo", 20.0, day(10)),
                bar(5, "polygon", 20.5, day(10)),
            ])
            .await
            .unwrap();

        let window = Window::new(day(1), day(9)).unwrap();
        let stored = store
            .query_bars(&Symbol::new("AAPL"), Timeframe::D1, &window)
            .await
            .unwrap();

        assert_eq!(stored.len(), 2);
        // Most recent fetch wins.
        assert_eq!(stored[0].provider, "yahoo");
        // Same fetch time: precedence wins.
        assert_eq!(stored[1].provider, "polygon");
    }

    #[tokio::test]
    async fn test_forecasts_coexist_by_confidence() {
        let store = SqliteStore::in_memory().unwrap();
        let base = bar(6, "model", 30.0, day(5));
        store
            .upsert_bars(&[
                base.clone(),
                base.clone().as_forecast(Some(0.6)),
                base.clone().as_forecast(Some(0.9)),
                base.as_forecast(Some(0.9)),
            ])
            .await
            .unwrap();

        let window = Window::new(day(1), day(9)).unwrap();
        let symbol = Symbol::new("AAPL");
        let forecasts = store
            .query_forecasts(&symbol, Timeframe::D1, &window)
            .await
            .unwrap();
        assert_eq!(forecasts.len(), 2);

        let historical = store.query_bars(&symbol, Timeframe::D1, &window).await.unwrap();
        assert_eq!(historical.len(), 1);
        assert!(!historical[0].is_forecast);
    }
}
