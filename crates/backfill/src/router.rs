//! Provider selection with rate limiting and single-step fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backfill_core::{
    BackfillError, Bar, BarProvider, FailureClass, RateDecision, RateLimiter, Symbol, Timeframe,
    TradingCalendar, Window,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Delay applied when a provider signals a rate limit without saying for how long.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Which routing rule a chunk falls under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Intraday window that ended before the current session opened.
    IntradayHistory,
    /// Intraday window touching the current session.
    IntradayCurrent,
    /// Daily and weekly bars.
    EndOfDay,
}

/// Primary provider and optional fallback for one route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Provider tried first.
    pub primary: String,
    /// Provider tried once if the primary fails transiently or has no data.
    #[serde(default)]
    pub secondary: Option<String>,
}

impl RouteTarget {
    /// Creates a target with a fallback.
    #[must_use]
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: Some(secondary.into()),
        }
    }

    /// Creates a target without a fallback.
    #[must_use]
    pub fn primary_only(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.secondary.as_deref())
    }
}

/// Provider choice keyed by timeframe class and window recency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
    /// Past intraday sessions.
    pub intraday_history: RouteTarget,
    /// The current intraday session.
    pub intraday_current: RouteTarget,
    /// Daily and weekly bars.
    pub end_of_day: RouteTarget,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            intraday_history: RouteTarget::new("polygon", "yahoo"),
            intraday_current: RouteTarget::new("tradier", "polygon"),
            end_of_day: RouteTarget::new("yahoo", "polygon"),
        }
    }
}

impl RoutingTable {
    /// Classifies a chunk relative to `now`.
    #[must_use]
    pub fn route(
        &self,
        calendar: &TradingCalendar,
        timeframe: Timeframe,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Route {
        if !timeframe.is_intraday() {
            return Route::EndOfDay;
        }
        match calendar.open_at(calendar.local_date(now)) {
            Some(open) if window.end <= open => Route::IntradayHistory,
            _ => Route::IntradayCurrent,
        }
    }

    /// Returns the target configured for a route.
    #[must_use]
    pub const fn target(&self, route: Route) -> &RouteTarget {
        match route {
            Route::IntradayHistory => &self.intraday_history,
            Route::IntradayCurrent => &self.intraday_current,
            Route::EndOfDay => &self.end_of_day,
        }
    }
}

/// Result of routing one chunk fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A provider returned bars.
    Bars {
        /// Provider whose bars are returned.
        provider: String,
        /// Raw provider bars, not yet normalized.
        bars: Vec<Bar>,
    },
    /// The last provider tried confirmed there is no data.
    NoData {
        /// Provider that answered last.
        provider: String,
    },
    /// Backpressure from the limiter or from upstream.
    Deferred {
        /// Provider that was throttled.
        provider: String,
        /// When to try again.
        retry_after: Duration,
    },
    /// The fetch failed.
    Failed {
        /// Provider that failed last, if any was tried.
        provider: Option<String>,
        /// The surfaced error.
        error: BackfillError,
    },
}

/// Routes chunk fetches to providers.
///
/// Every attempt, primary or fallback, takes a token from the provider's bucket
/// first. Only transient failures and "no data" answers fall through to the
/// secondary; rate limits defer and fatal errors surface at once. A response with
/// no valid bar inside the requested window counts as "no data".
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn BarProvider>>,
    costs: HashMap<String, f64>,
    table: RoutingTable,
    calendar: TradingCalendar,
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        providers.sort_unstable();
        f.debug_struct("ProviderRouter")
            .field("providers", &providers)
            .field("table", &self.table)
            .finish()
    }
}

impl ProviderRouter {
    /// Creates a router with no providers.
    #[must_use]
    pub fn new(table: RoutingTable, calendar: TradingCalendar, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            providers: HashMap::new(),
            costs: HashMap::new(),
            table,
            calendar,
            limiter,
        }
    }

    /// Registers a provider under its id, taking `cost` tokens per request.
    pub fn register(&mut self, provider: Arc<dyn BarProvider>, cost: f64) {
        debug!(provider = provider.id(), cost, "Registering bar provider");
        self.costs.insert(provider.id().to_string(), cost);
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Returns the ids of registered providers, sorted.
    #[must_use]
    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the routing table.
    #[must_use]
    pub const fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Whether a raw bar survives normalization for this window.
    fn is_usable(&self, timeframe: Timeframe, window: &Window, bar: &Bar) -> bool {
        bar.is_valid()
            && self
                .calendar
                .align(timeframe, bar.timestamp)
                .is_some_and(|slot| window.contains(slot))
    }

    /// Providers to try for a chunk, in order, skipping unregistered providers and
    /// providers that cannot serve the timeframe.
    fn candidates(
        &self,
        timeframe: Timeframe,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Vec<&Arc<dyn BarProvider>> {
        let route = self.table.route(&self.calendar, timeframe, window, now);
        self.table
            .target(route)
            .candidates()
            .filter_map(|id| self.providers.get(id))
            .filter(|provider| provider.supports(timeframe))
            .collect()
    }

    /// Fetches bars for one chunk.
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
        now: DateTime<Utc>,
    ) -> FetchOutcome {
        let candidates = self.candidates(timeframe, window, now);
        if candidates.is_empty() {
            return FetchOutcome::Failed {
                provider: None,
                error: BackfillError::ProviderNotConfigured(format!(
                    "No provider routed for {symbol} {timeframe}"
                )),
            };
        }

        let mut last: Option<(String, BackfillError)> = None;
        for provider in candidates {
            let id = provider.id().to_string();
            let cost = self.costs.get(&id).copied().unwrap_or(1.0);

            match self.limiter.acquire(&id, cost, now).await {
                Ok(RateDecision::Granted { remaining }) => {
                    debug!(provider = %id, remaining, "Rate token acquired");
                }
                Ok(RateDecision::Denied { retry_after }) => {
                    debug!(provider = %id, ?retry_after, "Rate limited locally, deferring");
                    return FetchOutcome::Deferred {
                        provider: id,
                        retry_after,
                    };
                }
                Err(error) => {
                    return FetchOutcome::Failed {
                        provider: Some(id),
                        error,
                    };
                }
            }

            debug!(provider = %id, %symbol, %timeframe, %window, "Fetching bars");
            let error = match provider.fetch_bars(symbol, timeframe, window).await {
                Ok(bars) if bars.iter().any(|bar| self.is_usable(timeframe, window, bar)) => {
                    return FetchOutcome::Bars { provider: id, bars };
                }
                Ok(bars) => {
                    if !bars.is_empty() {
                        debug!(provider = %id, received = bars.len(), "No usable bars in window");
                    }
                    BackfillError::DataNotAvailable {
                    symbol: symbol.to_string(),
                    start: window.start.to_rfc3339(),
                        end: window.end.to_rfc3339(),
                    }
                }
                Err(error) => error,
            };

            match error.class() {
                FailureClass::RateLimited => {
                    let retry_after = match &error {
                        BackfillError::RateLimited {
                            retry_after: Some(d),
                            ..
                        } => *d,
                        _ => DEFAULT_RATE_LIMIT_BACKOFF,
                    };
                    return FetchOutcome::Deferred {
                        provider: id,
                        retry_after,
                    };
                }
                FailureClass::Fatal => {
                    return FetchOutcome::Failed {
                        provider: Some(id),
                        error,
                    };
                }
                FailureClass::Transient | FailureClass::NotFound => {
                    warn!(provider = %id, %symbol, %timeframe, error = %error, "Provider failed, trying next");
                    last = Some((id, error));
                }
            }
        }

        match last {
            Some((provider, error)) if error.class() == FailureClass::NotFound => {
                FetchOutcome::NoData { provider }
            }
            Some((provider, error)) => FetchOutcome::Failed {
                provider: Some(provider),
                error,
            },
            None => FetchOutcome::Failed {
                provider: None,
                error: BackfillError::Other("All providers failed with no error".to_string()),
            },
        }
    }
}
