//! Error types for backfill operations.
//!
//! This module defines [`BackfillError`], which covers every failure that can occur
//! while fetching, normalizing, storing or scheduling bars, and [`FailureClass`],
//! the taxonomy the fetch worker uses to decide what happens to a chunk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during backfill operations.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// Network-related errors (connection failures, 5xx responses, etc.).
    #[error("Network error: {0}")]
    Network(String),

    /// An operation exceeded its wall-clock budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded by a provider.
    #[error("Rate limited by {provider}: retry after {retry_after:?}")]
    RateLimited {
        /// The provider that rate limited the request.
        provider: String,
        /// Suggested time to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// The requested symbol was not found.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// The provider has no data for the requested symbol and window.
    #[error("Data not available for {symbol} in range {start} to {end}")]
    DataNotAvailable {
        /// The symbol that was requested.
        symbol: String,
        /// Start of the requested window.
        start: String,
        /// End of the requested window.
        end: String,
    },

    /// Error parsing data from a provider.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error interacting with the persistent store.
    #[error("Store error: {0}")]
    Store(String),

    /// The requested provider is not configured.
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Authentication failed for a provider.
    #[error("Authentication failed for provider {0}")]
    AuthenticationFailed(String),

    /// The requested feature is not supported.
    #[error("Feature not supported: {0}")]
    NotSupported(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

/// How a failure affects the unit of work that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Backpressure: defer the work without counting an attempt.
    RateLimited,
    /// Retry with backoff until the attempt ceiling is reached.
    Transient,
    /// No data upstream: try the fallback provider, then treat as "no data".
    NotFound,
    /// Authentication or configuration problem: terminal immediately.
    Fatal,
}

impl BackfillError {
    /// Classifies this error for retry and fallback decisions.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited { .. } => FailureClass::RateLimited,
            Self::SymbolNotFound(_) | Self::DataNotAvailable { .. } => FailureClass::NotFound,
            Self::AuthenticationFailed(_)
            | Self::ProviderNotConfigured(_)
            | Self::InvalidParameter(_)
            | Self::NotSupported(_)
            | Self::Config(_) => FailureClass::Fatal,
            Self::Network(_)
            | Self::Timeout(_)
            | Self::Parse(_)
            | Self::Store(_)
            | Self::Other(_) => FailureClass::Transient,
        }
    }

    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::RateLimited | FailureClass::Transient
        )
    }
}

/// Result type alias using [`BackfillError`].
pub type Result<T> = std::result::Result<T, BackfillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let limited = BackfillError::RateLimited {
            provider: "polygon".to_string(),
            retry_after: None,
        };
        assert_eq!(limited.class(), FailureClass::RateLimited);
        assert!(limited.is_retryable());

        assert_eq!(
            BackfillError::Network("503".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            BackfillError::SymbolNotFound("ZZZZ".into()).class(),
            FailureClass::NotFound
        );

        let auth = BackfillError::AuthenticationFailed("tradier".into());
        assert_eq!(auth.class(), FailureClass::Fatal);
        assert!(!auth.is_retryable());
    }
}
