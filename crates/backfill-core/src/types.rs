//! Core data types for bar ingestion.
//!
//! This module defines the fundamental data structures:
//!
//! - [`Symbol`] - Trading symbol/ticker
//! - [`AssetClass`] / [`SymbolRecord`] - Symbol registry entries
//! - [`Window`] - Half-open UTC time interval
//! - [`Bar`] - Canonical OHLCV bar as stored by the engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BackfillError, Result};
use crate::timeframe::Timeframe;

/// A trading symbol/ticker.
///
/// Symbols are automatically uppercased on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a new symbol from a string, converting to uppercase.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    /// Returns the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Broad asset class of a registered symbol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// Common stock.
    #[default]
    Equity,
    /// Exchange-traded fund.
    Etf,
    /// Market index.
    Index,
    /// Crypto asset.
    Crypto,
    /// Currency pair.
    Forex,
    /// Futures contract.
    Future,
}

impl AssetClass {
    /// Returns the storage string for this asset class.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::Etf => "etf",
            Self::Index => "index",
            Self::Crypto => "crypto",
            Self::Forex => "forex",
            Self::Future => "future",
        }
    }
}

impl FromStr for AssetClass {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equity" => Ok(Self::Equity),
            "etf" => Ok(Self::Etf),
            "index" => Ok(Self::Index),
            "crypto" => Ok(Self::Crypto),
            "forex" => Ok(Self::Forex),
            "future" => Ok(Self::Future),
            other => Err(BackfillError::Parse(format!("Invalid asset class: {other}"))),
        }
    }
}

/// A registered symbol with its stable identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Stable registry identifier.
    pub id: i64,
    /// Ticker.
    pub symbol: Symbol,
    /// Asset class.
    pub asset_class: AssetClass,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Half-open UTC interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Window {
    /// Creates a window, rejecting empty or inverted intervals.
    ///
    /// # Errors
    /// Returns [`BackfillError::InvalidParameter`] if `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(BackfillError::InvalidParameter(format!(
                "Window start {start} is not before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Returns true if `ts` falls inside the window.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Returns true if the two windows share any instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `other` lies entirely inside this window.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the length of the window.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// A canonical OHLCV bar.
///
/// Historical bars are unique per (symbol, timestamp, timeframe, provider);
/// forecast bars are additionally keyed by their confidence score so that distinct
/// forecasts can coexist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Symbol the bar belongs to.
    pub symbol: Symbol,
    /// Timeframe of the bar.
    pub timeframe: Timeframe,
    /// Slot start of the bar.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the provider that produced the bar.
    pub provider: String,
    /// Opening price.
    pub open: f64,
    /// Highest price during the period.
    pub high: f64,
    /// Lowest price during the period.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// True when the timeframe is intraday.
    pub is_intraday: bool,
    /// True for forecast rows written by downstream models.
    pub is_forecast: bool,
    /// Confidence score of a forecast row.
    pub confidence: Option<f64>,
    /// When the bar was fetched from its provider.
    pub fetched_at: DateTime<Utc>,
}

impl Bar {
    /// Creates a historical bar fetched now, with no provider set.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            timestamp,
            provider: String::new(),
            open,
            high,
            low,
            close,
            volume,
            is_intraday: timeframe.is_intraday(),
            is_forecast: false,
            confidence: None,
            fetched_at: Utc::now(),
        }
    }

    /// Sets the provider identifier.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Sets the fetch time.
    #[must_use]
    pub const fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Marks the bar as a forecast with an optional confidence score.
    #[must_use]
    pub const fn as_forecast(mut self, confidence: Option<f64>) -> Self {
        self.is_forecast = true;
        self.confidence = confidence;
        self
    }

    /// Returns true if prices are finite and consistent and volume is non-negative.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p >= 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }

    /// Returns the confidence component of the uniqueness key.
    ///
    /// Historical bars always map to `0.0`; forecasts without a score map to `-1.0`.
    #[must_use]
    pub fn confidence_key(&self) -> f64 {
        if self.is_forecast {
            self.confidence.unwrap_or(-1.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_symbol_uppercase() {
        assert_eq!(Symbol::new(" aapl ").as_str(), "AAPL");
    }

    #[test]
    fn test_window_relations() {
        let a = Window::new(ts(1), ts(5)).unwrap();
        let b = Window::new(ts(4), ts(6)).unwrap();
        let c = Window::new(ts(5), ts(6)).unwrap();

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.contains(ts(1)));
        assert!(!a.contains(ts(5)));
        assert!(a.covers(&Window::new(ts(2), ts(3)).unwrap()));
        assert!(Window::new(ts(5), ts(5)).is_err());
    }

    #[test]
    fn test_bar_validity() {
        let bar = Bar::new(Symbol::new("X"), Timeframe::D1, ts(1), 10.0, 11.0, 9.5, 10.5, 100.0);
        assert!(bar.is_valid());
        assert!(!bar.is_intraday);

        let inverted = Bar { high: 9.0, ..bar.clone() };
        assert!(!inverted.is_valid());

        let nan = Bar { close: f64::NAN, ..bar };
        assert!(!nan.is_valid());
    }

    #[test]
    fn test_confidence_key() {
        let bar = Bar::new(Symbol::new("X"), Timeframe::D1, ts(1), 1.0, 1.0, 1.0, 1.0, 0.0);
        assert_eq!(bar.confidence_key(), 0.0);
        assert_eq!(bar.clone().as_forecast(None).confidence_key(), -1.0);
        assert_eq!(bar.as_forecast(Some(0.8)).confidence_key(), 0.8);
    }
}
