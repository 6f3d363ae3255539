#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/backfill/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Bar backfill orchestration and ingestion engine.
//!
//! This crate re-exports the core types, the stores and the provider clients, and
//! adds the orchestration layer on top of them:
//!
//! - [`BackfillService`] - requests, coverage definitions, triggers and reads
//! - [`Orchestrator`] - one tick of scanning and bounded concurrent fetching
//! - [`CoverageScanner`] - calendar-driven gap detection and self-healing
//! - [`FetchWorker`] - executes one claimed chunk
//! - [`ProviderRouter`] - provider choice, rate limiting and fallback
//! - [`ChunkPlanner`] - bounded chunk windows
//!
//! # Features
//!
//! - `yahoo` - Yahoo Finance chart provider
//! - `polygon` - Polygon.io aggregates provider
//! - `tradier` - Tradier market data provider
//! - `sqlite` - SQLite-backed store

// Core types and traits
pub use backfill_core::*;

// Stores
pub use backfill_store::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use backfill_store::SqliteStore;

// Providers
#[cfg(feature = "polygon")]
pub use backfill_polygon::PolygonProvider;
#[cfg(feature = "tradier")]
pub use backfill_tradier::TradierProvider;
#[cfg(feature = "yahoo")]
pub use backfill_yahoo::YahooProvider;

/// Engine configuration.
pub mod config;
/// Polars export of bars.
pub mod frame;
/// Tick scheduling.
pub mod orchestrator;
/// Chunk window planning.
pub mod planner;
/// Provider routing.
pub mod router;
/// Gap scanning.
pub mod scanner;
/// External interface.
pub mod service;
mod stores;
/// Chunk execution.
pub mod worker;

pub use config::{BackfillConfig, CalendarConfig, OrchestratorConfig, ProviderConfig, ScannerConfig};
pub use frame::bars_to_frame;
pub use orchestrator::{Orchestrator, TickSummary};
pub use planner::{ChunkPlanner, ChunkPolicy};
pub use router::{FetchOutcome, ProviderRouter, Route, RouteTarget, RoutingTable};
pub use scanner::{CoverageScanner, DefinitionScan, ScanReport};
pub use service::{BackfillRequest, BackfillService, BackfillServiceBuilder, Clock, configured_providers};
pub use stores::Stores;
pub use worker::{FetchWorker, WorkerReport, normalize_bars};
