//! The external surface of the engine.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use backfill_core::{
    AssetClass, BackfillError, BackfillJob, BackfillStore, Bar, BarProvider, ChunkScope,
    JobDefinition, JobProgress, JobStatus, Result, SeedPolicy, Symbol, Timeframe, TradingCalendar,
    Window,
};
use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::frame::bars_to_frame;
use crate::orchestrator::{Orchestrator, TickSummary};
use crate::planner::ChunkPlanner;
use crate::router::ProviderRouter;
use crate::scanner::CoverageScanner;
use crate::stores::Stores;
use crate::worker::FetchWorker;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Result of an explicit backfill request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// The (symbol, timeframe) job.
    pub job_id: i64,
    /// Requested symbol.
    pub symbol: Symbol,
    /// Requested timeframe.
    pub timeframe: Timeframe,
    /// Chunk windows covering the lookback.
    pub chunk_count: usize,
    /// Of those, chunks that did not exist yet.
    pub chunks_created: usize,
    /// Job status after seeding.
    pub status: JobStatus,
}

/// Builder for [`BackfillService`].
pub struct BackfillServiceBuilder {
    config: BackfillConfig,
    stores: Option<Stores>,
    providers: Vec<Arc<dyn BarProvider>>,
    clock: Clock,
}

impl fmt::Debug for BackfillServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillServiceBuilder")
            .field("config", &self.config)
            .field("store", &self.stores.as_ref().map(|_| "configured"))
            .field(
                "providers",
                &self.providers.iter().map(|p| p.id()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl BackfillServiceBuilder {
    /// Starts a builder from a configuration.
    #[must_use]
    pub fn new(config: BackfillConfig) -> Self {
        Self {
            config,
            stores: None,
            providers: Vec::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Uses one store for every persistence seam.
    #[must_use]
    pub fn with_store<S: BackfillStore + 'static>(self, store: Arc<S>) -> Self {
        self.with_stores(Stores::new(store))
    }

    /// Uses separate handles per persistence seam.
    #[must_use]
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Registers a bar provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn BarProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Replaces the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validates the configuration, configures a rate bucket per provider and
    /// wires the engine together.
    ///
    /// # Errors
    /// Returns [`BackfillError::Config`] for an invalid configuration or a missing
    /// store, or a store error while configuring buckets.
    pub async fn build(self) -> Result<BackfillService> {
        let config = self.config;
        config.validate()?;
        let stores = self
            .stores
            .ok_or_else(|| BackfillError::Config("No store configured".to_string()))?;
        let calendar = config.calendar.to_calendar()?;
        let now = (self.clock)();

        let mut router = ProviderRouter::new(
            config.routing.clone(),
            calendar.clone(),
            Arc::clone(&stores.limiter),
        );
        for provider in self.providers {
            let settings = config.provider(provider.id());
            stores
                .limiter
                .configure_bucket(provider.id(), settings.capacity, settings.refill_per_sec, now)
                .await?;
            router.register(provider, settings.request_cost);
        }
        if router.provider_ids().is_empty() {
            warn!("No bar providers registered; every chunk will fail");
        }
        let router = Arc::new(router);

        let planner = ChunkPlanner::new(calendar.clone(), config.chunking);
        let worker = Arc::new(FetchWorker::new(
            Arc::clone(&router),
            Arc::clone(&stores.bars),
            Arc::clone(&stores.jobs),
            calendar,
            config.orchestrator.worker_timeout,
        ));
        let scanner = CoverageScanner::new(stores.clone(), planner.clone(), config.scanner);
        let orchestrator = Orchestrator::new(
            Arc::clone(&stores.jobs),
            scanner,
            worker,
            config.orchestrator,
            &config.scanner,
        );

        info!(providers = ?router.provider_ids(), "Backfill service ready");
        Ok(BackfillService {
            config,
            stores,
            planner,
            router,
            orchestrator,
            clock: self.clock,
        })
    }
}

/// Entry point for requests, coverage definitions, triggers and reads.
pub struct BackfillService {
    config: BackfillConfig,
    stores: Stores,
    planner: ChunkPlanner,
    router: Arc<ProviderRouter>,
    orchestrator: Orchestrator,
    clock: Clock,
}

impl fmt::Debug for BackfillService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillService")
            .field("router", &self.router)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl BackfillService {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: BackfillConfig) -> BackfillServiceBuilder {
        BackfillServiceBuilder::new(config)
    }

    /// Opens the configured SQLite database and builds every enabled provider.
    ///
    /// Providers that need an API key are skipped with a warning when the key's
    /// environment variable is unset.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the database cannot be
    /// opened.
    #[cfg(feature = "sqlite")]
    pub async fn from_config(config: BackfillConfig) -> Result<Self> {
        config.validate()?;
        let store = backfill_store::SqliteStore::new(&config.database_path)?
            .with_retry_policy(config.retry);
        let mut builder = Self::builder(config.clone()).with_store(Arc::new(store));
        for provider in configured_providers(&config) {
            builder = builder.with_provider(provider);
        }
        builder.build().await
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Returns the trading calendar.
    #[must_use]
    pub const fn calendar(&self) -> &TradingCalendar {
        self.planner.calendar()
    }

    /// Returns the registered provider ids.
    #[must_use]
    pub fn provider_ids(&self) -> Vec<&str> {
        self.router.provider_ids()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Seeds a job covering the last `lookback_sessions` trading sessions.
    ///
    /// Repeating a request is idempotent: windows that already have a chunk are
    /// not duplicated and finished chunks are left alone.
    ///
    /// # Errors
    /// Returns [`BackfillError::InvalidParameter`] for a zero lookback.
    pub async fn request_backfill(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        lookback_sessions: u32,
    ) -> Result<BackfillRequest> {
        if lookback_sessions == 0 {
            return Err(BackfillError::InvalidParameter(
                "lookback_sessions must be at least 1".to_string(),
            ));
        }
        let now = self.now();
        self.stores
            .registry
            .register_symbol(symbol, AssetClass::default(), now)
            .await?;

        let windows = self.planner.plan_lookback(timeframe, lookback_sessions, now);
        let seeded = self
            .stores
            .jobs
            .seed_job(
                symbol,
                timeframe,
                &windows,
                self.config.orchestrator.request_priority,
                SeedPolicy::KeepCompleted,
                now,
            )
            .await?;

        info!(
            %symbol,
            %timeframe,
            job = seeded.job.id,
            chunks = seeded.chunks_requested,
            created = seeded.chunks_created,
            "Backfill requested"
        );
        Ok(BackfillRequest {
            job_id: seeded.job.id,
            symbol: symbol.clone(),
            timeframe,
            chunk_count: seeded.chunks_requested,
            chunks_created: seeded.chunks_created,
            status: seeded.job.status,
        })
    }

    /// Creates or updates a recurring coverage definition.
    ///
    /// # Errors
    /// Returns [`BackfillError::InvalidParameter`] for a zero lookback.
    pub async fn watch(&self, definition: JobDefinition) -> Result<JobDefinition> {
        if definition.lookback_sessions == 0 {
            return Err(BackfillError::InvalidParameter(
                "lookback_sessions must be at least 1".to_string(),
            ));
        }
        let now = self.now();
        self.stores
            .registry
            .register_symbol(&definition.symbol, AssetClass::default(), now)
            .await?;
        let stored = self.stores.registry.upsert_definition(&definition, now).await?;
        debug!(id = stored.id, symbol = %stored.symbol, timeframe = %stored.timeframe, "Coverage definition saved");
        Ok(stored)
    }

    /// Returns every coverage definition.
    pub async fn definitions(&self) -> Result<Vec<JobDefinition>> {
        self.stores.registry.definitions(false).await
    }

    /// Returns progress for (symbol, timeframe).
    pub async fn get_job_status(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<JobProgress> {
        self.stores.jobs.job_progress(symbol, timeframe).await
    }

    /// Returns the job for (symbol, timeframe), if any.
    pub async fn get_job(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Option<BackfillJob>> {
        self.stores.jobs.job(symbol, timeframe).await
    }

    /// Returns deduplicated bars in `window`, ascending.
    pub async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<Vec<Bar>> {
        self.stores.bars.query_bars(symbol, timeframe, window).await
    }

    /// Returns deduplicated bars in `window` as a `DataFrame`.
    pub async fn get_bars_frame(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        window: &Window,
    ) -> Result<DataFrame> {
        bars_to_frame(&self.get_bars(symbol, timeframe, window).await?)
    }

    /// Runs one unscoped tick.
    pub async fn trigger(&self) -> TickSummary {
        self.orchestrator.tick(None, self.now()).await
    }

    /// Runs one tick limited to a symbol, and optionally one timeframe.
    ///
    /// The scoped definitions are scanned regardless of when they were last
    /// scanned, and only chunks inside the scope are claimed.
    pub async fn trigger_for(&self, symbol: &Symbol, timeframe: Option<Timeframe>) -> TickSummary {
        let scope = ChunkScope {
            symbol: symbol.clone(),
            timeframe,
        };
        self.orchestrator.tick(Some(&scope), self.now()).await
    }

    /// Triggers a tick every `tick_interval` until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.config.orchestrator.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval = ?self.config.orchestrator.tick_interval, "Trigger loop started");
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Trigger loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let summary = self.trigger().await;
                    for error in &summary.errors {
                        debug!(%error, "Tick error");
                    }
                }
            }
        }
    }
}

/// Builds the providers enabled in `config` for which credentials are present.
#[must_use]
#[allow(unused_mut, unused_variables)]
pub fn configured_providers(config: &BackfillConfig) -> Vec<Arc<dyn BarProvider>> {
    let mut providers: Vec<Arc<dyn BarProvider>> = Vec::new();

    #[cfg(feature = "yahoo")]
    {
        let settings = config.provider(backfill_yahoo::PROVIDER_ID);
        if settings.enabled {
            let mut provider = backfill_yahoo::YahooProvider::new();
            if let Some(url) = &settings.base_url {
                provider = provider.with_base_url(url.clone());
            }
            providers.push(Arc::new(provider));
        }
    }

    #[cfg(feature = "polygon")]
    {
        let settings = config.provider(backfill_polygon::PROVIDER_ID);
        if settings.enabled {
            match settings.api_key() {
                Some(key) => {
                    let mut provider = backfill_polygon::PolygonProvider::new(key);
                    if let Some(url) = &settings.base_url {
                        provider = provider.with_base_url(url.clone());
                    }
                    providers.push(Arc::new(provider));
                }
                None => warn!(env = ?settings.api_key_env, "Polygon API key not set; provider disabled"),
            }
        }
    }

    #[cfg(feature = "tradier")]
    {
        let settings = config.provider(backfill_tradier::PROVIDER_ID);
        if settings.enabled {
            match settings.api_key() {
                Some(token) => {
                    let mut provider = backfill_tradier::TradierProvider::new(token);
                    if let Some(url) = &settings.base_url {
                        provider = provider.with_base_url(url.clone());
                    }
                    providers.push(Arc::new(provider));
                }
                None => warn!(env = ?settings.api_key_env, "Tradier token not set; provider disabled"),
            }
        }
    }

    providers
}
