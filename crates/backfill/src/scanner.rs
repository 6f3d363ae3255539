//! Gap-driven coverage scanning.
//!
//! For every due [`JobDefinition`] the scanner compares the slots the calendar
//! expects over the definition's lookback with the bars actually stored, and seeds
//! chunks for the missing runs. A bar fetched before its slot closed holds a
//! partial session and counts as missing until it is fetched again. The scanner
//! also returns `error` chunks to the queue once their cooldown has passed, so
//! stalled backfills heal without an operator.

use std::collections::BTreeSet;

use backfill_core::{ChunkScope, ChunkStatus, JobDefinition, Result, RunStatus, SeedPolicy, Window};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ScannerConfig;
use crate::planner::ChunkPlanner;
use crate::stores::Stores;

/// Totals from one scanner pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Definitions scanned.
    pub scanned: usize,
    /// Definitions skipped because they were scanned recently.
    pub skipped: usize,
    /// Expected slots found missing.
    pub missing_slots: usize,
    /// Chunks inserted or reopened.
    pub chunks_created: usize,
    /// Errored chunks returned to the queue.
    pub chunks_reseeded: usize,
    /// Per-definition failures.
    pub errors: Vec<String>,
}

/// Result of scanning one definition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionScan {
    /// Completed slots the calendar expects.
    pub expected_slots: usize,
    /// Of those, slots with no stored bar or only a partial one.
    pub missing_slots: usize,
    /// Windows handed to the repository.
    pub windows_seeded: usize,
    /// Chunks inserted or reopened.
    pub chunks_created: usize,
    /// Errored chunks returned to the queue.
    pub chunks_reseeded: usize,
}

/// Diffs expected against stored bars and seeds the gaps.
#[derive(Clone, Debug)]
pub struct CoverageScanner {
    stores: Stores,
    planner: ChunkPlanner,
    config: ScannerConfig,
}

impl CoverageScanner {
    /// Creates a scanner.
    #[must_use]
    pub const fn new(stores: Stores, planner: ChunkPlanner, config: ScannerConfig) -> Self {
        Self {
            stores,
            planner,
            config,
        }
    }

    /// Scans every enabled definition that is due, or every enabled definition in
    /// `scope` regardless of when it was last scanned.
    #[instrument(skip(self), fields(scoped = scope.is_some()))]
    pub async fn scan(&self, scope: Option<&ChunkScope>, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for definition in self.stores.registry.definitions(true).await? {
            let due = match scope {
                Some(scope) => scope.matches(&definition.symbol, definition.timeframe),
                None => self.is_due(&definition, now),
            };
            if !due {
                report.skipped += 1;
                continue;
            }

            match self.scan_definition(&definition, now).await {
                Ok(scan) => {
                    report.scanned += 1;
                    report.missing_slots += scan.missing_slots;
                    report.chunks_created += scan.chunks_created;
                    report.chunks_reseeded += scan.chunks_reseeded;
                }
                Err(e) => {
                    warn!(
                        symbol = %definition.symbol,
                        timeframe = %definition.timeframe,
                        error = %e,
                        "Coverage scan failed"
                    );
                    report.errors.push(format!(
                        "scan {} {}: {e}",
                        definition.symbol, definition.timeframe
                    ));
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                missing = report.missing_slots,
                created = report.chunks_created,
                reseeded = report.chunks_reseeded,
                "Coverage scan complete"
            );
        }
        Ok(report)
    }

    fn is_due(&self, definition: &JobDefinition, now: DateTime<Utc>) -> bool {
        definition.last_scanned_at.is_none_or(|at| {
            (now - at)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.config.scan_interval)
        })
    }

    /// Scans one definition and marks it scanned.
    pub async fn scan_definition(
        &self,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<DefinitionScan> {
        let symbol = &definition.symbol;
        let timeframe = definition.timeframe;
        let series = ChunkScope::series(symbol.clone(), timeframe);
        let calendar = self.planner.calendar();

        let chunks_reseeded = self
            .stores
            .jobs
            .reseed_errored(Some(&series), now - self.config.error_cooldown, now)
            .await?;

        let sessions = self.planner.sessions(definition.lookback_sessions, now);
        let expected = calendar.completed_slots(timeframe, &sessions, now);
        let mut scan = DefinitionScan {
            expected_slots: expected.len(),
            chunks_reseeded,
            ..DefinitionScan::default()
        };

        if let (Some(first), Some(last)) = (expected.first(), expected.last()) {
            let range = Window::new(*first, calendar.slot_end(timeframe, *last))?;
            let stored: BTreeSet<DateTime<Utc>> = self
                .stores
                .bars
                .query_bars(symbol, timeframe, &range)
                .await?
                .into_iter()
                .filter(|bar| bar.fetched_at >= calendar.slot_end(timeframe, bar.timestamp))
                .map(|bar| bar.timestamp)
                .collect();
            let missing: Vec<DateTime<Utc>> = expected
                .iter()
                .copied()
                .filter(|slot| !stored.contains(slot))
                .collect();
            scan.missing_slots = missing.len();

            let gaps = self.planner.gap_windows(timeframe, &missing, &expected);
            let windows = self.unclaimed(definition, gaps, now).await?;
            if !windows.is_empty() {
                let seeded = self
                    .stores
                    .jobs
                    .seed_job(
                        symbol,
                        timeframe,
                        &windows,
                        definition.priority,
                        SeedPolicy::ReopenCompleted,
                        now,
                    )
                    .await?;
                scan.windows_seeded = windows.len();
                scan.chunks_created = seeded.chunks_created;
            }
        }

        self.stores.registry.mark_scanned(definition.id, now).await?;
        debug!(%symbol, %timeframe, ?scan, "Definition scanned");
        Ok(scan)
    }

    /// Drops gap windows that are already queued, in flight or parked in `error`,
    /// and windows a recent run already fetched without filling.
    async fn unclaimed(
        &self,
        definition: &JobDefinition,
        windows: Vec<Window>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Window>> {
        if windows.is_empty() {
            return Ok(windows);
        }
        let symbol = &definition.symbol;
        let timeframe = definition.timeframe;

        let busy: Vec<Window> = self
            .stores
            .jobs
            .chunks(
                symbol,
                timeframe,
                &[ChunkStatus::Pending, ChunkStatus::Running, ChunkStatus::Error],
            )
            .await?
            .into_iter()
            .map(|chunk| chunk.window)
            .collect();

        let recent: Vec<Window> = self
            .stores
            .jobs
            .runs_since(symbol, timeframe, now - self.config.refetch_cooldown)
            .await?
            .into_iter()
            .filter(|run| matches!(run.status, RunStatus::Succeeded | RunStatus::NoData))
            .map(|run| run.window)
            .collect();

        Ok(windows
            .into_iter()
            .filter(|w| !busy.iter().any(|b| b.overlaps(w)))
            .filter(|w| !recent.iter().any(|r| r.covers(w)))
            .collect())
    }
}
