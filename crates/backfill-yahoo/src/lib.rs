#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/backfill/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Yahoo Finance bar provider.
//!
//! This crate provides a Yahoo Finance provider that implements the
//! [`DataProvider`] and [`BarProvider`] traits from `backfill-core`.
//!
//! # Example
//!
//! ```no_run
//! use backfill_yahoo::YahooProvider;
//! use backfill_core::{BarProvider, Symbol, Timeframe, Window};
//! use chrono::{TimeZone, Utc};
//!
//! # async fn example() -> backfill_core::Result<()> {
//! let provider = YahooProvider::new();
//! let window = Window::new(
//!     Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
//!     Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
//! )?;
//!
//! let bars = provider
//!     .fetch_bars(&Symbol::new("AAPL"), Timeframe::D1, &window)
//!     .await?;
//! println!("Fetched {} bars", bars.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{
    BackfillError, Bar, BarProvider, DataProvider, Result, Symbol, Timeframe, Window,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

/// Yahoo Finance chart API base URL.
const CHART_API_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// User agent for HTTP requests.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Stable provider identifier.
pub const PROVIDER_ID: &str = "yahoo";

const SUPPORTED_TIMEFRAMES: &[Timeframe] =
    &[Timeframe::M15, Timeframe::H1, Timeframe::D1, Timeframe::W1];

/// Yahoo Finance bar provider.
#[derive(Debug, Clone)]
pub struct YahooProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooProvider {
    /// Create a new Yahoo Finance provider with default settings.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    /// Create a new Yahoo Finance provider with a custom HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: CHART_API_URL.to_string(),
        }
    }

    /// Overrides the chart API base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the chart API URL for a symbol and window.
    fn build_chart_url(&self, symbol: &Symbol, timeframe: Timeframe, window: &Window) -> Result<String> {
        let interval = match timeframe {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "60m",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1wk",
            Timeframe::H4 => {
                return Err(BackfillError::NotSupported(format!(
                    "Yahoo Finance does not serve {timeframe} bars"
                )));
            }
        };

        Ok(format!(
            "{}/{}?period1={}&period2={}&interval={}&includePrePost=false",
            self.base_url,
            symbol.as_str(),
            window.start.timestamp(),
            window.end.timestamp(),
            interval
        ))
    }

    /// Parse a chart response into bars, skipping rows with missing prices.
    fn parse_chart_response(
        symbol: &Symbol,
        timeframe: Timeframe,
        response: ChartResponse,
    ) -> Result<Vec<Bar>> {
        if let Some(error) = response.chart.error {
            if error.code == "Not Found" {
                return Err(BackfillError::SymbolNotFound(symbol.to_string()));
            }
            return Err(BackfillError::Other(format!(
                "{}: {}",
                error.code, error.description
            )));
        }

        let Some(result) = response.chart.result.into_iter().flatten().next() else {
            return Err(BackfillError::SymbolNotFound(symbol.to_string()));
        };

        let timestamps = result.timestamp.unwrap_or_default();
        let Some(quote) = result.indicators.quote.into_iter().next() else {
            return Ok(Vec::new());
        };

        let fetched_at = Utc::now();
        let bars = timestamps
            .iter()
            .enumerate()
            .filter_map(|(i, &ts)| {
                let timestamp = DateTime::from_timestamp(ts, 0)?;
                let open = quote.open.get(i).copied().flatten()?;
                let high = quote.high.get(i).copied().flatten()?;
                let low = quote.low.get(i).copied().flatten()?;
                let close = quote.close.get(i).copied().flatten()?;
                #[allow(clippy::cast_precision_loss)]
                let volume = quote.volume.get(i).copied().flatten().unwrap_or(0) as f64;
                Some(
                    Bar::new(symbol.clone(), timeframe, timestamp, open, high, low, close, volume)
                        .with_provider(PROVIDER_ID)
                        .with_fetched_at(fetched_at),
                )
            })
            .collect();
        Ok(bars)
    }
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DataProvider for YahooProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Yahoo Finance"
    }

    fn description(&self) -> &str {
        "Yahoo Finance chart API for intraday and end-of-day bars"
    }

    fn supported_timeframes(&self) -> &[Timeframe] {
        SUPPORTED_TIMEFRAMES
    }
}

#[async_trait]
impl BarProvider for YahooProvider {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        let url = self.build_chart_url(symbol, timeframe, window)?;
        debug!("Fetching bars: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackfillError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackfillError::RateLimited {
                provider: PROVIDER_ID.to_string(),
                retry_after: retry_after(&response).or(Some(Duration::from_secs(60))),
            });
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BackfillError::SymbolNotFound(symbol.to_string()));
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackfillError::AuthenticationFailed(PROVIDER_ID.to_string()));
        }

        if !status.is_success() {
            return Err(BackfillError::Network(format!("HTTP {status} for {symbol}")));
        }

        let chart_response: ChartResponse = response
            .json()
            .await
            .map_err(|e| BackfillError::Parse(e.to_string()))?;

        Self::parse_chart_response(symbol, timeframe, chart_response)
    }
}

/// Reads a `Retry-After` header expressed in seconds.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ============================================================================
// Yahoo Finance API Response Types
// ============================================================================

/// Chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_build_chart_url() {
        let provider = YahooProvider::new();
        let url = provider
            .build_chart_url(&Symbol::new("AAPL"), Timeframe::H1, &window())
            .unwrap();

        assert!(url.contains("/AAPL?"));
        assert!(url.contains("interval=60m"));
        assert!(url.contains("period1=1704067200"));
        assert!(
            provider
                .build_chart_url(&Symbol::new("AAPL"), Timeframe::H4, &window())
                .is_err()
        );
    }

    #[test]
    fn test_parse_chart_response_skips_gaps() {
        let json = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1704205800, 1704292200, 1704378600],
                    "indicators": {
                        "quote": [{
                            "open": [187.15, null, 182.15],
                            "high": [188.44, 185.88, 183.09],
                            "low": [183.89, 183.43, 180.88],
                            "close": [185.64, 184.25, 181.91],
                            "volume": [82488700, 58414500, null]
                        }]
                    }
                }],
                "error": null
            }
        }"#;
        let response: ChartResponse = serde_json::from_str(json).unwrap();
        let bars =
            YahooProvider::parse_chart_response(&Symbol::new("AAPL"), Timeframe::D1, response)
                .unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].provider, PROVIDER_ID);
        assert_eq!(bars[0].close, 185.64);
        assert_eq!(bars[1].volume, 0.0);
    }

    #[test]
    fn test_parse_not_found() {
        let json = r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}}}"#;
        let response: ChartResponse = serde_json::from_str(json).unwrap();
        let err = YahooProvider::parse_chart_response(&Symbol::new("ZZZZ"), Timeframe::D1, response)
            .unwrap_err();
        assert!(matches!(err, BackfillError::SymbolNotFound(_)));
    }

    #[test]
    fn test_provider_info() {
        let provider = YahooProvider::default();

        assert_eq!(provider.id(), "yahoo");
        assert_eq!(provider.name(), "Yahoo Finance");
        assert!(provider.supports(Timeframe::D1));
        assert!(!provider.supports(Timeframe::H4));
    }
}
