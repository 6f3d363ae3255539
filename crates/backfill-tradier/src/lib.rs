#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/backfill/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Tradier bar provider.
//!
//! Implements the `backfill-core` provider traits on top of Tradier's market data
//! REST API. Tradier returns a bare object instead of a one-element array when a
//! query matches a single row, which the response types absorb with
//! [`OneOrMany`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Bar, BarProvider, DataProvider, Result, Symbol, Timeframe, Window,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::America::New_York;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Base URL for the Tradier brokerage API.
const TRADIER_BASE_URL: &str = "https://api.tradier.com";

/// Stable provider identifier.
pub const PROVIDER_ID: &str = "tradier";

const SUPPORTED_TIMEFRAMES: &[Timeframe] = &Timeframe::ALL;

/// Tradier bar provider.
#[derive(Clone)]
pub struct TradierProvider {
    client: Client,
    token: String,
    base_url: String,
}

impl fmt::Debug for TradierProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradierProvider")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl TradierProvider {
    /// Create a new Tradier provider with the given access token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client, token)
    }

    /// Create a new Tradier provider with a custom HTTP client.
    #[must_use]
    pub fn with_client(client: Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: TRADIER_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL (e.g. the sandbox host).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Query parameters for a window, in exchange-local time as Tradier expects.
    fn query(symbol: &Symbol, timeframe: Timeframe, window: &Window) -> (&'static str, Vec<(&'static str, String)>) {
        let last = window.end - chrono::Duration::milliseconds(1);
        match timeframe {
            Timeframe::D1 | Timeframe::W1 => {
                let interval = if timeframe == Timeframe::D1 { "daily" } else { "weekly" };
                (
                    "/v1/markets/history",
                    vec![
                        ("symbol", symbol.to_string()),
                        ("interval", interval.to_string()),
                        ("start", local_date(window.start).to_string()),
                        ("end", local_date(last).to_string()),
                    ],
                )
            }
            Timeframe::M15 | Timeframe::H1 | Timeframe::H4 => (
                "/v1/markets/timesales",
                vec![
                    ("symbol", symbol.to_string()),
                    ("interval", "15min".to_string()),
                    ("start", local_minute(window.start)),
                    ("end", local_minute(last)),
                    ("session_filter", "open".to_string()),
                ],
            ),
        }
    }

    /// Make an authenticated GET request and parse the JSON response.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: &Symbol,
    ) -> Result<T> {
        debug!("Tradier request: {} {:?}", path, query);

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| BackfillError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackfillError::RateLimited {
                provider: PROVIDER_ID.to_string(),
                retry_after: None,
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackfillError::AuthenticationFailed(PROVIDER_ID.to_string()));
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BackfillError::SymbolNotFound(symbol.to_string()));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackfillError::Network(format!("HTTP {status}: {text}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| BackfillError::Network(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| BackfillError::Parse(format!("{e}: {text}")))
    }
}

fn local_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&New_York).date_naive()
}

fn local_minute(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&New_York).format("%Y-%m-%d %H:%M").to_string()
}

fn history_bars(
    symbol: &Symbol,
    timeframe: Timeframe,
    response: HistoryResponse,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Bar>> {
    let days = response
        .history
        .and_then(|h| h.day)
        .map(OneOrMany::into_vec)
        .unwrap_or_default();

    days.into_iter()
        .map(|day| {
            let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
                .map_err(|e| BackfillError::Parse(format!("Invalid date {}: {e}", day.date)))?;
            let timestamp = backfill_core::calendar::midnight_utc(date);
            Ok(Bar::new(
                symbol.clone(),
                timeframe,
                timestamp,
                day.open,
                day.high,
                day.low,
                day.close,
                day.volume,
            )
            .with_provider(PROVIDER_ID)
            .with_fetched_at(fetched_at))
        })
        .collect()
}

fn timesales_bars(
    symbol: &Symbol,
    timeframe: Timeframe,
    response: TimesalesResponse,
    fetched_at: DateTime<Utc>,
) -> Vec<Bar> {
    response
        .series
        .and_then(|s| s.data)
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|point| {
            let timestamp = DateTime::from_timestamp(point.timestamp, 0)?;
            Some(
                Bar::new(
                    symbol.clone(),
                    timeframe,
                    timestamp,
                    point.open,
                    point.high,
                    point.low,
                    point.close,
                    point.volume,
                )
                .with_provider(PROVIDER_ID)
                .with_fetched_at(fetched_at),
            )
        })
        .collect()
}

impl DataProvider for TradierProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Tradier"
    }

    fn description(&self) -> &str {
        "Tradier market data API for current-session intraday and end-of-day bars"
    }

    fn supported_timeframes(&self) -> &[Timeframe] {
        SUPPORTED_TIMEFRAMES
    }
}

#[async_trait]
impl BarProvider for TradierProvider {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let (path, query) = Self::query(symbol, timeframe, window);
        let fetched_at = Utc::now();

        if timeframe.is_intraday() {
            let response: TimesalesResponse = self.get(path, &query, symbol).await?;
            Ok(timesales_bars(symbol, timeframe, response, fetched_at))
        } else {
            let response: HistoryResponse = self.get(path, &query, symbol).await?;
            history_bars(symbol, timeframe, response, fetched_at)
        }
    }
}

// ============================================================================
// Tradier API Response Types
// ============================================================================

/// A JSON value that is either a single object or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single object.
    One(T),
    /// An array of objects.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Flattens into a vector.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// `/v1/markets/history` response.
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: Option<History>,
}

#[derive(Debug, Deserialize)]
struct History {
    day: Option<OneOrMany<HistoryDay>>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryDay {
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// `/v1/markets/timesales` response.
#[derive(Debug, Deserialize)]
struct TimesalesResponse {
    series: Option<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    data: Option<OneOrMany<TimesalesPoint>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimesalesPoint {
    /// Bar start, epoch seconds.
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_intraday_query_uses_exchange_time() {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 21, 0, 0).unwrap(),
        )
        .unwrap();
        let (path, query) = TradierProvider::query(&Symbol::new("AAPL"), Timeframe::H1, &window);

        assert_eq!(path, "/v1/markets/timesales");
        assert!(query.contains(&("start", "2024-03-05 09:30".to_string())));
        assert!(query.contains(&("end", "2024-03-05 15:59".to_string())));
        assert!(query.contains(&("interval", "15min".to_string())));
    }

    #[test]
    fn test_daily_query_dates() {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let (path, query) = TradierProvider::query(&Symbol::new("AAPL"), Timeframe::D1, &window);
        assert_eq!(path, "/v1/markets/history");
        // Midnight UTC is the prior evening in New York.
        assert!(query.contains(&("start", "2024-03-03".to_string())));
    }

    #[test]
    fn test_history_single_object() {
        let json = r#"{"history": {"day": {"date": "2024-03-04", "open": 176.15, "high": 176.9, "low": 173.79, "close": 175.1, "volume": 81510101}}}"#;
        let response: HistoryResponse = serde_json::from_str(json).unwrap();
        let bars = history_bars(&Symbol::new("AAPL"), Timeframe::D1, response, Utc::now()).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(
            bars[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_history_null() {
        let response: HistoryResponse = serde_json::from_str(r#"{"history": null}"#).unwrap();
        let bars = history_bars(&Symbol::new("AAPL"), Timeframe::D1, response, Utc::now()).unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn test_timesales_array() {
        let json = r#"{"series": {"data": [
            {"time": "2024-03-05T09:30:00", "timestamp": 1709649000, "price": 170.2, "open": 170.0, "high": 170.6, "low": 169.9, "close": 170.4, "volume": 52000, "vwap": 170.3},
            {"time": "2024-03-05T09:45:00", "timestamp": 1709649900, "price": 170.5, "open": 170.4, "high": 170.8, "low": 170.1, "close": 170.6, "volume": 31000, "vwap": 170.5}
        ]}}"#;
        let response: TimesalesResponse = serde_json::from_str(json).unwrap();
        let bars = timesales_bars(&Symbol::new("AAPL"), Timeframe::M15, response, Utc::now());
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].volume, 31000.0);
        assert_eq!(bars[0].provider, PROVIDER_ID);
    }

    #[test]
    fn test_debug_redacts_token() {
        let provider = TradierProvider::new("secret_token");
        let debug_str = format!("{provider:?}");
        assert!(!debug_str.contains("secret_token"));
    }
}
