//! Shared fixtures for the engine tests.

#![allow(dead_code, unreachable_pub)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backfill::calendar::midnight_utc;
use backfill::{
    BackfillConfig, BackfillError, BackfillService, Bar, BarProvider, DataProvider, ProviderConfig,
    Result, RetryPolicy, SqliteStore, Symbol, Timeframe, Window,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// A settable clock shared between the test and the service.
#[derive(Clone, Debug)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

/// What a [`MockProvider`] answers with.
#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// One daily bar per weekday in the window, closing at the given price.
    Daily(f64),
    /// An empty response.
    Empty,
    /// A network failure.
    Down,
    /// A rejected API key.
    Unauthorized,
    /// An upstream 429.
    Throttled,
}

#[derive(Debug)]
pub struct MockProvider {
    id: &'static str,
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(id: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            id,
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DataProvider for MockProvider {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        "Scripted test provider"
    }

    fn supported_timeframes(&self) -> &[Timeframe] {
        &Timeframe::ALL
    }
}

#[async_trait]
impl BarProvider for MockProvider {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        match script {
            Script::Daily(close) => Ok(daily_bars(symbol, timeframe, window, close, self.id)),
            Script::Empty => Ok(Vec::new()),
            Script::Down => Err(BackfillError::Network(format!("{} unreachable", self.id))),
            Script::Unauthorized => Err(BackfillError::AuthenticationFailed(self.id.to_string())),
            Script::Throttled => Err(BackfillError::RateLimited {
                provider: self.id.to_string(),
                retry_after: Some(std::time::Duration::from_secs(120)),
            }),
        }
    }
}

fn daily_bars(symbol: &Symbol, timeframe: Timeframe, window: &Window, close: f64, id: &str) -> Vec<Bar> {
    let mut bars = Vec::new();
    let mut date = window.start.date_naive();
    while midnight_utc(date) < window.end {
        bars.push(
            Bar::new(
                symbol.clone(),
                timeframe,
                midnight_utc(date),
                close - 1.0,
                close + 1.0,
                close - 2.0,
                close,
                1_000.0,
            )
            .with_provider(id),
        );
        date = date.succ_opt().unwrap();
    }
    bars
}

pub fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Default configuration with generous buckets so rate limits only bite when a
/// test asks for it.
pub fn config() -> BackfillConfig {
    let mut config = BackfillConfig::default();
    for id in ["yahoo", "polygon", "tradier"] {
        config.providers.insert(
            id.to_string(),
            ProviderConfig {
                capacity: 1_000.0,
                refill_per_sec: 100.0,
                ..ProviderConfig::default()
            },
        );
    }
    config
}

pub fn retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: std::time::Duration::from_secs(30),
        max_backoff: std::time::Duration::from_secs(60),
    }
}

pub struct Harness {
    pub service: BackfillService,
    pub store: Arc<SqliteStore>,
    pub clock: TestClock,
}

pub async fn harness(
    config: BackfillConfig,
    providers: &[Arc<MockProvider>],
    now: DateTime<Utc>,
) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap().with_retry_policy(config.retry));
    let clock = TestClock::at(now);
    let handle = clock.clone();
    let mut builder = BackfillService::builder(config)
        .with_store(Arc::clone(&store))
        .with_clock(move || handle.now());
    for provider in providers {
        builder = builder.with_provider(Arc::clone(provider) as Arc<dyn BarProvider>);
    }
    Harness {
        service: builder.build().await.unwrap(),
        store,
        clock,
    }
}
