//! `backfill` command line interface.
//!
//! Commands:
//! - `run` - trigger a tick every `tick_interval` until ctrl-c
//! - `tick` - run one tick, optionally scoped to a symbol and timeframe
//! - `request` - seed a one-off backfill over a lookback
//! - `watch` - create or update a recurring coverage definition
//! - `definitions` - list coverage definitions
//! - `status` - job progress for a symbol and timeframe
//! - `bars` - read stored bars

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use backfill::calendar::midnight_utc;
use backfill::{BackfillConfig, BackfillService, JobDefinition, Symbol, Timeframe, Window};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/backfill.toml";

#[derive(Debug, Parser)]
#[command(name = "backfill", about = "Bar backfill orchestration and ingestion engine")]
struct Cli {
    /// Configuration file. Defaults to config/backfill.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Trigger a tick every tick_interval until interrupted.
    Run,
    /// Run a single tick.
    Tick {
        /// Only scan and claim work for this symbol.
        #[arg(long)]
        symbol: Option<Symbol>,

        /// Narrow the scope to one timeframe (requires --symbol).
        #[arg(long, requires = "symbol")]
        timeframe: Option<Timeframe>,
    },
    /// Seed a backfill covering the last N trading sessions.
    Request {
        /// Ticker symbol.
        symbol: Symbol,

        /// Bar timeframe (15m, 1h, 4h, 1d, 1w).
        #[arg(long, default_value = "1d")]
        timeframe: Timeframe,

        /// Trading sessions to cover.
        #[arg(long, default_value_t = 30)]
        lookback: u32,
    },
    /// Create or update a recurring coverage definition.
    Watch {
        /// Ticker symbol.
        symbol: Symbol,

        /// Bar timeframe (15m, 1h, 4h, 1d, 1w).
        #[arg(long, default_value = "1d")]
        timeframe: Timeframe,

        /// Trailing trading sessions to keep filled.
        #[arg(long, default_value_t = 30)]
        lookback: u32,

        /// Priority of seeded chunks; higher runs first.
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Store the definition disabled.
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    /// List coverage definitions.
    Definitions,
    /// Show job progress.
    Status {
        /// Ticker symbol.
        symbol: Symbol,

        /// Bar timeframe.
        #[arg(long, default_value = "1d")]
        timeframe: Timeframe,
    },
    /// Print stored bars.
    Bars {
        /// Ticker symbol.
        symbol: Symbol,

        /// Bar timeframe.
        #[arg(long, default_value = "1d")]
        timeframe: Timeframe,

        /// First date (YYYY-MM-DD, inclusive).
        #[arg(long)]
        start: NaiveDate,

        /// Last date (YYYY-MM-DD, inclusive). Defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let service = BackfillService::from_config(config)
        .await
        .context("failed to start backfill service")?;

    match cli.command {
        Command::Run => {
            service
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for ctrl-c");
                    }
                })
                .await;
        }
        Command::Tick { symbol, timeframe } => {
            let summary = match symbol {
                Some(symbol) => service.trigger_for(&symbol, timeframe).await,
                None => service.trigger().await,
            };
            print_json(&summary)?;
        }
        Command::Request {
            symbol,
            timeframe,
            lookback,
        } => {
            print_json(&service.request_backfill(&symbol, timeframe, lookback).await?)?;
        }
        Command::Watch {
            symbol,
            timeframe,
            lookback,
            priority,
            disabled,
        } => {
            let mut definition = JobDefinition::new(symbol, timeframe, lookback).with_priority(priority);
            definition.enabled = !disabled;
            print_json(&service.watch(definition).await?)?;
        }
        Command::Definitions => print_json(&service.definitions().await?)?,
        Command::Status { symbol, timeframe } => {
            print_json(&service.get_job_status(&symbol, timeframe).await?)?;
        }
        Command::Bars {
            symbol,
            timeframe,
            start,
            end,
        } => {
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            let Some(after_end) = end.succ_opt() else {
                bail!("end date out of range: {end}");
            };
            if after_end <= start {
                bail!("end date {end} is before start date {start}");
            }
            let window = Window::new(midnight_utc(start), midnight_utc(after_end))?;
            print_json(&service.get_bars(&symbol, timeframe, &window).await?)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BackfillConfig> {
    match path {
        Some(path) => BackfillConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => BackfillConfig::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("failed to load {DEFAULT_CONFIG}")),
        None => Ok(BackfillConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
