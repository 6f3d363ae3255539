#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/backfill/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Polygon.io bar provider.
//!
//! This crate implements the `backfill-core` provider traits for the
//! [Polygon.io](https://polygon.io/) aggregates API.
//!
//! # Usage
//!
//! ```rust,ignore
//! use backfill_polygon::PolygonProvider;
//! use backfill_core::{BarProvider, Symbol, Timeframe, Window};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = PolygonProvider::new("your_api_key");
//!     let window = Window::new(start, end)?;
//!
//!     let bars = provider.fetch_bars(&Symbol::new("AAPL"), Timeframe::M15, &window).await?;
//!
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Bar, BarProvider, DataProvider, Result, Symbol, Timeframe, Window,
};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

/// Base URL for the Polygon REST API.
const POLYGON_BASE_URL: &str = "https://api.polygon.io";

/// Stable provider identifier.
pub const PROVIDER_ID: &str = "polygon";

/// Supported timeframes for Polygon.
const SUPPORTED_TIMEFRAMES: &[Timeframe] = &Timeframe::ALL;

/// Upper bound on followed `next_url` pages per request.
const MAX_PAGES: usize = 20;

/// Polygon.io bar provider.
#[derive(Clone)]
pub struct PolygonProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl fmt::Debug for PolygonProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolygonProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl PolygonProvider {
    /// Create a new Polygon provider with the given API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client, api_key)
    }

    /// Create a new Polygon provider with a custom HTTP client.
    #[must_use]
    pub fn with_client(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: POLYGON_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Multiplier and timespan requested for a timeframe.
    const fn aggregate_span(timeframe: Timeframe) -> (u32, &'static str) {
        match timeframe {
            Timeframe::M15 | Timeframe::H1 | Timeframe::H4 => (15, "minute"),
            Timeframe::D1 => (1, "day"),
            Timeframe::W1 => (1, "week"),
        }
    }

    /// Build the aggregates URL for a symbol and window. Polygon's `to` bound is
    /// inclusive, so the window end is pulled back by one millisecond.
    fn aggs_url(&self, symbol: &Symbol, timeframe: Timeframe, window: &Window) -> String {
        let (multiplier, timespan) = Self::aggregate_span(timeframe);
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit=50000&apiKey={}",
            self.base_url,
            symbol.as_str(),
            multiplier,
            timespan,
            window.start.timestamp_millis(),
            window.end.timestamp_millis() - 1,
            self.api_key
        )
    }

    /// Appends the API key to a pagination cursor URL.
    fn with_key(&self, next_url: &str) -> String {
        if next_url.contains('?') {
            format!("{next_url}&apiKey={}", self.api_key)
        } else {
            format!("{next_url}?apiKey={}", self.api_key)
        }
    }

    /// Make a GET request and parse one page of aggregates.
    async fn get_page(&self, url: &str, symbol: &Symbol) -> Result<AggsResponse> {
        let response = self
            .client
            .get(url)
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

        parse_page(&text)
    }
}

/// Parses an aggregates page, mapping API-level error statuses.
fn parse_page(text: &str) -> Result<AggsResponse> {
    let page: AggsResponse =
        serde_json::from_str(text).map_err(|e| BackfillError::Parse(format!("{e}: {text}")))?;

    match page.status.as_str() {
        "OK" | "DELAYED" => Ok(page),
        "NOT_AUTHORIZED" => Err(BackfillError::AuthenticationFailed(PROVIDER_ID.to_string())),
        other => Err(BackfillError::Other(format!(
            "Polygon status {other}: {}",
            page.error.or(page.message).unwrap_or_default()
        ))),
    }
}

fn to_bars(symbol: &Symbol, timeframe: Timeframe, aggs: Vec<AggBar>, fetched_at: DateTime<Utc>) -> Vec<Bar> {
    aggs.into_iter()
        .filter_map(|agg| {
            let timestamp = DateTime::from_timestamp_millis(agg.t)?;
            Some(
                Bar::new(symbol.clone(), timeframe, timestamp, agg.o, agg.h, agg.l, agg.c, agg.v)
                    .with_provider(PROVIDER_ID)
                    .with_fetched_at(fetched_at),
            )
        })
        .collect()
}

impl DataProvider for PolygonProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Polygon.io"
    }

    fn description(&self) -> &str {
        "Polygon.io aggregates API for intraday and end-of-day bars"
    }

    fn supported_timeframes(&self) -> &[Timeframe] {
        SUPPORTED_TIMEFRAMES
    }
}

#[async_trait]
impl BarProvider for PolygonProvider {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        tracing::debug!(%symbol, %timeframe, %window, "Polygon aggregates request");

        let fetched_at = Utc::now();
        let mut bars = Vec::new();
        let mut url = self.aggs_url(symbol, timeframe, window);

        for _ in 0..MAX_PAGES {
            let page = self.get_page(&url, symbol).await?;
            bars.extend(to_bars(
                symbol,
                timeframe,
                page.results.unwrap_or_default(),
                fetched_at,
            ));
            match page.next_url {
                Some(next) => url = self.with_key(&next),
                None => return Ok(bars),
            }
        }

        tracing::warn!(%symbol, pages = MAX_PAGES, "Polygon pagination truncated");
        Ok(bars)
    }
}

// ============================================================================
// Polygon API Response Types
// ============================================================================

/// Aggregates (bars) response.
#[derive(Debug, Clone, Deserialize)]
struct AggsResponse {
    status: String,
    #[serde(default)]
    results: Option<Vec<AggBar>>,
    next_url: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

/// A single aggregate bar.
#[derive(Debug, Clone, Deserialize)]
struct AggBar {
    /// Bar start, epoch milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 21, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_building() {
        let provider = PolygonProvider::new("test_key");
        let url = provider.aggs_url(&Symbol::new("AAPL"), Timeframe::H1, &window());
        assert_eq!(
            url,
            "https://api.polygon.io/v2/aggs/ticker/AAPL/range/15/minute/1709649000000/1709672399999\
             ?adjusted=true&sort=asc&limit=50000&apiKey=test_key"
        );
        assert_eq!(
            provider.with_key("https://api.polygon.io/v2/aggs/cursor?cursor=abc"),
            "https://api.polygon.io/v2/aggs/cursor?cursor=abc&apiKey=test_key"
        );
    }

    #[test]
    fn test_parse_page() {
        let text = r#"{
            "ticker": "AAPL",
            "status": "OK",
            "resultsCount": 2,
            "results": [
                {"v": 1200.0, "vw": 170.1, "o": 170.0, "c": 170.5, "h": 171.0, "l": 169.5, "t": 1709649000000, "n": 12},
                {"v": 900.0, "o": 170.5, "c": 170.2, "h": 170.9, "l": 170.0, "t": 1709649900000}
            ]
        }"#;
        let page = parse_page(text).unwrap();
        let bars = to_bars(
            &Symbol::new("AAPL"),
            Timeframe::M15,
            page.results.unwrap(),
            Utc::now(),
        );
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, window().start);
        assert_eq!(bars[1].provider, PROVIDER_ID);
    }

    #[test]
    fn test_parse_empty_and_errors() {
        let empty = parse_page(r#"{"status": "OK", "resultsCount": 0}"#).unwrap();
        assert!(empty.results.is_none());

        let auth = parse_page(r#"{"status": "NOT_AUTHORIZED", "message": "plan"}"#).unwrap_err();
        assert!(matches!(auth, BackfillError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_provider_metadata() {
        let provider = PolygonProvider::new("test_key");
        assert_eq!(provider.id(), "polygon");
        assert!(!provider.description().is_empty());
        assert_eq!(provider.supported_timeframes(), &Timeframe::ALL);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let provider = PolygonProvider::new("secret_key_12345");
        let debug_str = format!("{:?}", provider);
        assert!(!debug_str.contains("secret_key_12345"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
