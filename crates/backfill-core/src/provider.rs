//! Provider traits for fetching bars.
//!
//! This module defines the provider contract:
//!
//! - [`DataProvider`] - Base trait carrying identity and capabilities
//! - [`BarProvider`] - Normalized OHLCV fetch over a time window
//!
//! Providers return canonical [`Bar`]s in UTC but do not need to snap timestamps to
//! slots or filter to the requested window; the worker normalizes every result.
//! Intraday bars may also be finer than the requested timeframe (for example
//! 15-minute bars for an hourly request); the worker rolls them up into slots.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::Result,
    timeframe::Timeframe,
    types::{Bar, Symbol, Window},
};

/// Read-time precedence between providers that produced a bar for the same slot.
///
/// Used only to break ties between rows fetched at the same instant; the most
/// recently fetched row wins otherwise.
pub const PROVIDER_PRECEDENCE: [&str; 3] = ["polygon", "tradier", "yahoo"];

/// Returns the precedence rank of a provider (lower wins; unknown providers last).
#[must_use]
pub fn precedence_rank(provider: &str) -> usize {
    PROVIDER_PRECEDENCE
        .iter()
        .position(|p| *p == provider)
        .unwrap_or(PROVIDER_PRECEDENCE.len())
}

/// Base trait for all bar providers.
///
/// All providers must implement this trait to provide basic metadata
/// about the provider and its capabilities.
pub trait DataProvider: Send + Sync + Debug {
    /// Returns the stable identifier used for routing, rate limiting and storage
    /// (e.g., "polygon").
    fn id(&self) -> &str;

    /// Returns the display name of this provider (e.g., "Polygon.io").
    fn name(&self) -> &str;

    /// Returns a description of this provider.
    fn description(&self) -> &str;

    /// Returns the timeframes this provider can serve.
    fn supported_timeframes(&self) -> &[Timeframe];

    /// Returns true if `timeframe` is in [`supported_timeframes`](Self::supported_timeframes).
    fn supports(&self, timeframe: Timeframe) -> bool {
        self.supported_timeframes().contains(&timeframe)
    }
}

/// Provider for OHLCV bars.
#[async_trait]
pub trait BarProvider: DataProvider {
    /// Fetches bars for one symbol and timeframe covering `window`.
    ///
    /// An empty vector means the provider has no data for the window. Returned bars
    /// should carry this provider's [`id`](DataProvider::id).
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_rank() {
        assert!(precedence_rank("polygon") < precedence_rank("tradier"));
        assert!(precedence_rank("tradier") < precedence_rank("yahoo"));
        assert_eq!(precedence_rank("mock"), PROVIDER_PRECEDENCE.len());
    }
}
