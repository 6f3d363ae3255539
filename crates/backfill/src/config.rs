//! Engine configuration.
//!
//! [`BackfillConfig`] is loaded from a TOML file. Every section has defaults, so
//! an empty file is a valid configuration. Durations are written in seconds.
//!
//! ```toml
//! database_path = "backfill.db"
//! log_level = "info"
//!
//! [orchestrator]
//! max_concurrency = 4
//! worker_timeout = 60
//! lease = 300
//!
//! [providers.polygon]
//! api_key_env = "POLYGON_API_KEY"
//! capacity = 5.0
//! refill_per_sec = 0.0833
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backfill_core::{BackfillError, Result, RetryPolicy, TradingCalendar};
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::planner::ChunkPolicy;
use crate::router::RoutingTable;

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Tick fan-out and timeouts.
    pub orchestrator: OrchestratorConfig,
    /// Chunk retry ceiling and backoff.
    pub retry: RetryPolicy,
    /// Coverage scanner cadence and cooldowns.
    pub scanner: ScannerConfig,
    /// Chunk sizing.
    pub chunking: ChunkPolicy,
    /// Exchange calendar.
    pub calendar: CalendarConfig,
    /// Provider clients and their rate buckets, keyed by provider id.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Provider routing.
    pub routing: RoutingTable,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("backfill.db"),
            log_level: "info".to_string(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetryPolicy::default(),
            scanner: ScannerConfig::default(),
            chunking: ChunkPolicy::default(),
            calendar: CalendarConfig::default(),
            providers: default_providers(),
            routing: RoutingTable::default(),
        }
    }
}

impl BackfillConfig {
    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    /// Returns [`BackfillError::Config`] on malformed TOML or invalid values.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| BackfillError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a configuration file.
    ///
    /// # Errors
    /// Returns [`BackfillError::Config`] if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackfillError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    /// Returns [`BackfillError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrency == 0 {
            return Err(config_err("orchestrator.max_concurrency must be at least 1"));
        }
        if o.worker_timeout.is_zero() {
            return Err(config_err("orchestrator.worker_timeout must be positive"));
        }
        if o.lease <= o.worker_timeout {
            return Err(config_err(
                "orchestrator.lease must be longer than orchestrator.worker_timeout",
            ));
        }
        if o.tick_interval.is_zero() {
            return Err(config_err("orchestrator.tick_interval must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_err("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(config_err("retry.base_backoff exceeds retry.max_backoff"));
        }

        let c = &self.chunking;
        if c.intraday_sessions == 0 || c.daily_slots == 0 || c.weekly_slots == 0 {
            return Err(config_err("chunking sizes must be at least 1"));
        }

        for (id, provider) in &self.providers {
            if !(provider.capacity > 0.0 && provider.capacity.is_finite()) {
                return Err(config_err(&format!(
                    "providers.{id}.capacity must be positive"
                )));
            }
            if !(provider.refill_per_sec > 0.0 && provider.refill_per_sec.is_finite()) {
                return Err(config_err(&format!(
                    "providers.{id}.refill_per_sec must be positive"
                )));
            }
            if !(provider.request_cost > 0.0 && provider.request_cost <= provider.capacity) {
                return Err(config_err(&format!(
                    "providers.{id}.request_cost must be positive and within capacity"
                )));
            }
        }

        self.calendar.to_calendar()?;
        Ok(())
    }

    /// Returns the settings for a provider id, or the defaults for unlisted ids.
    #[must_use]
    pub fn provider(&self, id: &str) -> ProviderConfig {
        self.providers.get(id).cloned().unwrap_or_default()
    }
}

fn config_err(message: &str) -> BackfillError {
    BackfillError::Config(message.to_string())
}

/// Tick fan-out, timeouts and loop cadence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Chunks claimed and executed concurrently per tick.
    pub max_concurrency: usize,
    /// Wall-clock budget of one worker.
    #[serde(with = "secs")]
    pub worker_timeout: Duration,
    /// How long a claimed chunk stays leased to its worker.
    #[serde(with = "secs")]
    pub lease: Duration,
    /// Period of the trigger loop.
    #[serde(with = "secs")]
    pub tick_interval: Duration,
    /// Priority given to jobs seeded by explicit requests.
    pub request_priority: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            worker_timeout: Duration::from_secs(60),
            lease: Duration::from_secs(300),
            tick_interval: Duration::from_secs(60),
            request_priority: 10,
        }
    }
}

/// Coverage scanner cadence and cooldowns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Run the scanner as part of unscoped ticks.
    pub enabled: bool,
    /// Minimum time between scans of one definition.
    #[serde(with = "secs")]
    pub scan_interval: Duration,
    /// Age after which `error` chunks are reseeded.
    #[serde(with = "secs")]
    pub error_cooldown: Duration,
    /// Windows covered by a successful run this recent are not refetched.
    #[serde(with = "secs")]
    pub refetch_cooldown: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval: Duration::from_secs(15 * 60),
            error_cooldown: Duration::from_secs(60 * 60),
            refetch_cooldown: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Exchange calendar settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// IANA timezone of the exchange.
    pub timezone: String,
    /// Regular session open, exchange-local `HH:MM`.
    pub open: String,
    /// Regular session close, exchange-local `HH:MM`.
    pub close: String,
    /// Apply the rule-based US exchange holidays.
    pub exchange_holidays: bool,
    /// Additional full-day closures.
    pub extra_holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            open: "09:30".to_string(),
            close: "16:00".to_string(),
            exchange_holidays: true,
            extra_holidays: Vec::new(),
        }
    }
}

impl CalendarConfig {
    /// Builds the trading calendar.
    ///
    /// # Errors
    /// Returns [`BackfillError::Config`] for an unknown timezone or bad session times.
    pub fn to_calendar(&self) -> Result<TradingCalendar> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|_| config_err(&format!("Unknown timezone: {}", self.timezone)))?;
        let open = parse_time(&self.open)?;
        let close = parse_time(&self.close)?;

        let calendar = TradingCalendar::new(tz, open, close)
            .map_err(|e| BackfillError::Config(e.to_string()))?
            .with_holidays(self.extra_holidays.iter().copied());
        Ok(if self.exchange_holidays {
            calendar
        } else {
            calendar.without_exchange_holidays()
        })
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| config_err(&format!("Invalid session time {s}: {e}")))
}

/// One provider client and its shared rate bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Build this provider from configuration.
    pub enabled: bool,
    /// Environment variable holding the API key, if the provider needs one.
    pub api_key_env: Option<String>,
    /// Overrides the provider's API host.
    pub base_url: Option<String>,
    /// Bucket capacity in requests.
    pub capacity: f64,
    /// Requests regained per second.
    pub refill_per_sec: f64,
    /// Tokens taken per request.
    pub request_cost: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: None,
            base_url: None,
            capacity: 10.0,
            refill_per_sec: 1.0,
            request_cost: 1.0,
        }
    }
}

impl ProviderConfig {
    /// Reads the API key from the configured environment variable.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|key| !key.trim().is_empty())
    }
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    BTreeMap::from([
        (
            "yahoo".to_string(),
            ProviderConfig {
                capacity: 5.0,
                refill_per_sec: 0.5,
                ..ProviderConfig::default()
            },
        ),
        (
            "polygon".to_string(),
            ProviderConfig {
                api_key_env: Some("POLYGON_API_KEY".to_string()),
                capacity: 5.0,
                // Free tier: five requests per minute.
                refill_per_sec: 5.0 / 60.0,
                ..ProviderConfig::default()
            },
        ),
        (
            "tradier".to_string(),
            ProviderConfig {
                api_key_env: Some("TRADIER_API_KEY".to_string()),
                capacity: 10.0,
                refill_per_sec: 2.0,
                ..ProviderConfig::default()
            },
        ),
    ])
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
