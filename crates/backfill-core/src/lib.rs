#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/backfill/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for the bar backfill engine.
//!
//! This crate provides the foundational abstractions shared by providers, stores
//! and the orchestration layer:
//!
//! - [`BarProvider`](provider::BarProvider) - Normalized upstream fetch contract
//! - [`BarStore`](store::BarStore) - Idempotent, deduplicated bar storage
//! - [`JobRepository`](store::JobRepository) - Job/chunk lifecycle and claim protocol
//! - [`CoverageRegistry`](store::CoverageRegistry) - Symbols and recurring coverage
//! - [`RateLimiter`](store::RateLimiter) - Persistent per-provider token buckets
//! - [`TradingCalendar`](calendar::TradingCalendar) - Expected bar slots per session

/// Exchange trading calendar and bar slot arithmetic.
pub mod calendar;
/// Error types and failure classification.
pub mod error;
/// Backfill job, chunk, definition and audit types.
pub mod job;
/// Provider traits for fetching bars.
pub mod provider;
/// Token bucket state and decisions.
pub mod rate;
/// Storage traits.
pub mod store;
/// Bar timeframes.
pub mod timeframe;
/// Core data types (Symbol, Bar, Window).
pub mod types;

pub use calendar::TradingCalendar;
pub use error::{BackfillError, FailureClass, Result};
pub use job::{
    BackfillChunk, BackfillJob, ChunkClaim, ChunkOutcome, ChunkScope, ChunkStatus,
    ChunkTransition, JobDefinition, JobProgress, JobRun, JobStatus, RetryPolicy, RunStatus,
    SeedPolicy, SeededJob,
};
pub use provider::{BarProvider, DataProvider, PROVIDER_PRECEDENCE, precedence_rank};
pub use rate::{RateBucket, RateDecision};
pub use store::{BackfillStore, BarStore, CoverageRegistry, JobRepository, RateLimiter};
pub use timeframe::Timeframe;
pub use types::{AssetClass, Bar, Symbol, SymbolRecord, Window};
