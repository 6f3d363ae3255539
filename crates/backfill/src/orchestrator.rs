//! One scheduler tick: scan, claim, fan out, summarize.

use std::sync::Arc;

use backfill_core::{ChunkOutcome, ChunkScope, ChunkTransition, JobRepository};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{OrchestratorConfig, ScannerConfig};
use crate::scanner::CoverageScanner;
use crate::worker::{FetchWorker, WorkerReport};

/// Everything that happened during one tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// When the tick started.
    pub started_at: Option<DateTime<Utc>>,
    /// Definitions scanned for gaps.
    pub scanned: usize,
    /// Chunks seeded by the scanner.
    pub chunks_created: usize,
    /// Errored chunks put back in the queue by the scanner.
    pub chunks_reseeded: usize,
    /// Chunks claimed and handed to workers.
    pub jobs_dispatched: usize,
    /// Chunks that wrote bars.
    pub succeeded: usize,
    /// Chunks where no provider had data.
    pub no_data: usize,
    /// Chunks pushed back by rate limits.
    pub deferred: usize,
    /// Chunks requeued with backoff.
    pub retrying: usize,
    /// Chunks that reached `error`.
    pub failed: usize,
    /// Completions discarded because the lease had moved on.
    pub stale: usize,
    /// Bars inserted or updated.
    pub rows_written: usize,
    /// Failure messages.
    pub errors: Vec<String>,
}

impl TickSummary {
    fn absorb(&mut self, report: &WorkerReport) {
        self.rows_written += report.rows_written();
        match (&report.outcome, report.transition) {
            (_, ChunkTransition::Stale) => self.stale += 1,
            (ChunkOutcome::Succeeded { .. }, _) => self.succeeded += 1,
            (ChunkOutcome::NoData, _) => self.no_data += 1,
            (ChunkOutcome::Deferred { .. }, _) => self.deferred += 1,
            (ChunkOutcome::Failed { message, .. }, transition) => {
                if matches!(transition, ChunkTransition::Errored { .. }) {
                    self.failed += 1;
                } else {
                    self.retrying += 1;
                }
                let chunk = &report.chunk;
                self.errors.push(format!(
                    "{} {} {}: {message}",
                    chunk.symbol, chunk.timeframe, chunk.window
                ));
            }
        }
    }
}

/// Runs ticks against the shared repository.
pub struct Orchestrator {
    jobs: Arc<dyn JobRepository>,
    scanner: CoverageScanner,
    worker: Arc<FetchWorker>,
    config: OrchestratorConfig,
    scan_enabled: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scanner", &self.scanner)
            .field("worker", &self.worker)
            .field("config", &self.config)
            .field("scan_enabled", &self.scan_enabled)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        scanner: CoverageScanner,
        worker: Arc<FetchWorker>,
        config: OrchestratorConfig,
        scanner_config: &ScannerConfig,
    ) -> Self {
        Self {
            jobs,
            scanner,
            worker,
            config,
            scan_enabled: scanner_config.enabled,
        }
    }

    /// Returns the coverage scanner.
    #[must_use]
    pub const fn scanner(&self) -> &CoverageScanner {
        &self.scanner
    }

    /// Runs one tick.
    ///
    /// Scans due definitions (every definition in `scope` when scoped), claims at
    /// most `max_concurrency` chunks, executes them concurrently and waits for all
    /// of them. Failures are collected into the summary rather than returned.
    #[instrument(skip(self), fields(scoped = scope.is_some()))]
    pub async fn tick(&self, scope: Option<&ChunkScope>, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary {
            started_at: Some(now),
            ..TickSummary::default()
        };

        if self.scan_enabled || scope.is_some() {
            match self.scanner.scan(scope, now).await {
                Ok(report) => {
                    summary.scanned = report.scanned;
                    summary.chunks_created = report.chunks_created;
                    summary.chunks_reseeded = report.chunks_reseeded;
                    summary.errors.extend(report.errors);
                }
                Err(e) => {
                    warn!(error = %e, "Coverage scan failed");
                    summary.errors.push(format!("scan: {e}"));
                }
            }
        }

        let mut claims = Vec::with_capacity(self.config.max_concurrency);
        while claims.len() < self.config.max_concurrency {
            match self.jobs.claim_next_chunk(scope, self.config.lease, now).await {
                Ok(Some(claim)) => claims.push(claim),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Chunk claim failed");
                    summary.errors.push(format!("claim: {e}"));
                    break;
                }
            }
        }
        summary.jobs_dispatched = claims.len();

        let handles = claims.into_iter().map(|claim| {
            let worker = Arc::clone(&self.worker);
            tokio::spawn(async move { worker.execute(claim, now).await })
        });

        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(report)) => summary.absorb(&report),
                Ok(Err(e)) => {
                    warn!(error = %e, "Chunk completion failed");
                    summary.errors.push(format!("complete: {e}"));
                }
                Err(e) => {
                    warn!(error = %e, "Worker task panicked");
                    summary.errors.push(format!("worker: {e}"));
                }
            }
        }

        info!(
            scanned = summary.scanned,
            created = summary.chunks_created,
            dispatched = summary.jobs_dispatched,
            succeeded = summary.succeeded,
            no_data = summary.no_data,
            deferred = summary.deferred,
            retrying = summary.retrying,
            failed = summary.failed,
            rows = summary.rows_written,
            "Tick complete"
        );
        summary
    }
}
