//! End-to-end tests of the service against a SQLite store and scripted providers.

mod common;

use std::sync::Arc;

use backfill::{
    BarStore, ChunkOutcome, ChunkStatus, ChunkTransition, InMemoryStore, JobDefinition,
    JobRepository, JobStatus, ScannerConfig, Symbol, Timeframe, Window, calendar::midnight_utc,
};
use chrono::Duration;
use common::{MockProvider, Script, config, harness, retry, utc};

fn daily_window(from: (u32, u32), to: (u32, u32)) -> Window {
    Window::new(utc(2024, from.0, from.1, 0), utc(2024, to.0, to.1, 0)).unwrap()
}

#[tokio::test]
async fn test_request_backfill_fills_daily_lookback() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(100.0));
    let mut cfg = config();
    cfg.orchestrator.max_concurrency = 2;
    // Friday evening in New York: sessions Feb 26 through Mar 1.
    let h = harness(cfg, &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");

    let request = h.service.request_backfill(&symbol, Timeframe::D1, 5).await.unwrap();
    assert_eq!(request.chunk_count, 5);
    assert_eq!(request.chunks_created, 5);
    assert_eq!(request.status, JobStatus::Pending);

    let first = h.service.trigger().await;
    assert_eq!(first.jobs_dispatched, 2);
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.rows_written, 2);

    let mut ticks = 1;
    while h.service.trigger().await.jobs_dispatched > 0 {
        ticks += 1;
        assert!(ticks < 10, "backfill did not settle");
    }
    assert_eq!(ticks, 3);
    assert_eq!(yahoo.calls(), 5);

    let progress = h.service.get_job_status(&symbol, Timeframe::D1).await.unwrap();
    assert_eq!(progress.status, Some(JobStatus::Done));
    assert_eq!(progress.done, 5);
    assert!((progress.progress_pct - 100.0).abs() < f64::EPSILON);

    let bars = h
        .service
        .get_bars(&symbol, Timeframe::D1, &daily_window((2, 26), (3, 2)))
        .await
        .unwrap();
    let stamps: Vec<_> = bars.iter().map(|b| b.timestamp).collect();
    assert_eq!(
        stamps,
        (26..=29)
            .map(|d| utc(2024, 2, d, 0))
            .chain([utc(2024, 3, 1, 0)])
            .collect::<Vec<_>>()
    );
    assert!(bars.iter().all(|b| b.provider == "yahoo" && b.fetched_at == utc(2024, 3, 2, 0)));

    let again = h.service.request_backfill(&symbol, Timeframe::D1, 5).await.unwrap();
    assert_eq!(again.chunks_created, 0);
    assert_eq!(again.status, JobStatus::Done);
}

#[tokio::test]
async fn test_zero_lookback_is_rejected() {
    let h = harness(config(), &[], utc(2024, 3, 2, 0)).await;
    assert!(h.service.request_backfill(&Symbol::new("X"), Timeframe::D1, 0).await.is_err());
    assert!(h.service.watch(JobDefinition::new(Symbol::new("X"), Timeframe::D1, 0)).await.is_err());
}

#[tokio::test]
async fn test_falls_back_to_secondary_provider() {
    let yahoo = MockProvider::new("yahoo", Script::Down);
    let polygon = MockProvider::new("polygon", Script::Daily(50.0));
    let h = harness(
        config(),
        &[Arc::clone(&yahoo), Arc::clone(&polygon)],
        utc(2024, 3, 2, 0),
    )
    .await;
    let symbol = Symbol::new("X");

    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();
    let summary = h.service.trigger().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!((yahoo.calls(), polygon.calls()), (1, 1));

    let bars = h
        .service
        .get_bars(&symbol, Timeframe::D1, &daily_window((3, 1), (3, 2)))
        .await
        .unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].provider, "polygon");
    assert_eq!(bars[0].close, 50.0);
}

#[tokio::test]
async fn test_terminal_error_reports_secondary_failure() {
    let yahoo = MockProvider::new("yahoo", Script::Down);
    let polygon = MockProvider::new("polygon", Script::Down);
    let mut cfg = config();
    cfg.retry = retry(1);
    let h = harness(cfg, &[yahoo, polygon], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");

    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();
    let summary = h.service.trigger().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);

    let progress = h.service.get_job_status(&symbol, Timeframe::D1).await.unwrap();
    assert_eq!(progress.status, Some(JobStatus::Error));
    let last_error = progress.last_error.unwrap();
    assert!(last_error.contains("polygon unreachable"), "{last_error}");
}

#[tokio::test]
async fn test_fatal_error_skips_fallback() {
    let yahoo = MockProvider::new("yahoo", Script::Unauthorized);
    let polygon = MockProvider::new("polygon", Script::Daily(1.0));
    let h = harness(config(), &[yahoo, Arc::clone(&polygon)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");

    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();
    let summary = h.service.trigger().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(polygon.calls(), 0);

    let chunks = h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Error);
    assert_eq!(chunks[0].attempts, 1);
}

#[tokio::test]
async fn test_empty_responses_complete_as_no_data() {
    let yahoo = MockProvider::new("yahoo", Script::Empty);
    let polygon = MockProvider::new("polygon", Script::Empty);
    let h = harness(config(), &[yahoo, polygon], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");

    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();
    let summary = h.service.trigger().await;
    assert_eq!(summary.no_data, 1);
    assert_eq!(summary.rows_written, 0);

    let job = h.service.get_job(&symbol, Timeframe::D1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let yahoo = MockProvider::new("yahoo", Script::Down);
    let mut cfg = config();
    cfg.retry = retry(3);
    let h = harness(cfg, &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();

    let first = h.service.trigger().await;
    assert_eq!(first.retrying, 1);

    // Still backing off.
    assert_eq!(h.service.trigger().await.jobs_dispatched, 0);

    h.clock.advance(Duration::minutes(2));
    assert_eq!(h.service.trigger().await.retrying, 1);

    h.clock.advance(Duration::minutes(2));
    let last = h.service.trigger().await;
    assert_eq!(last.failed, 1);

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.service.trigger().await.jobs_dispatched, 0);
    assert_eq!(yahoo.calls(), 3);

    let chunks = h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Error);
    assert_eq!(chunks[0].attempts, 3);
}

#[tokio::test]
async fn test_upstream_throttle_defers_without_attempt() {
    let yahoo = MockProvider::new("yahoo", Script::Throttled);
    let h = harness(config(), &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();

    let summary = h.service.trigger().await;
    assert_eq!(summary.deferred, 1);
    assert!(summary.errors.is_empty());

    let chunk = &h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap()[0];
    assert_eq!(chunk.status, ChunkStatus::Pending);
    assert_eq!(chunk.attempts, 0);
    assert!(chunk.available_at >= utc(2024, 3, 2, 0) + Duration::seconds(120));

    yahoo.set(Script::Daily(10.0));
    h.clock.advance(Duration::minutes(1));
    assert_eq!(h.service.trigger().await.jobs_dispatched, 0);

    h.clock.advance(Duration::minutes(2));
    let summary = h.service.trigger().await;
    assert_eq!(summary.succeeded, 1);
    let chunk = &h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap()[0];
    assert_eq!(chunk.attempts, 0);
}

#[tokio::test]
async fn test_token_denial_defers_without_calling_provider() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(10.0));
    let mut cfg = config();
    cfg.orchestrator.max_concurrency = 2;
    let yahoo_limits = cfg.providers.get_mut("yahoo").unwrap();
    yahoo_limits.capacity = 1.0;
    yahoo_limits.refill_per_sec = 0.01;
    let h = harness(cfg, &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    h.service.request_backfill(&symbol, Timeframe::D1, 2).await.unwrap();

    let summary = h.service.trigger().await;
    assert_eq!(summary.jobs_dispatched, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.deferred, 1);
    assert_eq!(yahoo.calls(), 1);

    let pending = h
        .store
        .chunks(&symbol, Timeframe::D1, &[ChunkStatus::Pending])
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
}

#[tokio::test]
async fn test_gap_scan_seeds_only_missing_days() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(20.0));
    let now = utc(2024, 3, 1, 0);
    let h = harness(config(), &[Arc::clone(&yahoo)], now).await;
    let symbol = Symbol::new("X");

    let calendar = h.service.calendar();
    let sessions = calendar.sessions_back(calendar.local_date(now), 30);
    assert_eq!(sessions.len(), 30);
    let missing = [sessions[3], sessions[4], sessions[20]];
    let stored: Vec<_> = sessions
        .iter()
        .filter(|d| !missing.contains(d))
        .map(|d| {
            backfill::Bar::new(symbol.clone(), Timeframe::D1, midnight_utc(*d), 1.0, 2.0, 0.5, 1.5, 10.0)
                .with_provider("polygon")
                .with_fetched_at(now)
        })
        .collect();
    h.store.upsert_bars(&stored).await.unwrap();

    h.service
        .watch(JobDefinition::new(symbol.clone(), Timeframe::D1, 30))
        .await
        .unwrap();

    let summary = h.service.trigger().await;
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.chunks_created, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(yahoo.calls(), 3);

    let range = Window::new(midnight_utc(sessions[0]), now).unwrap();
    let bars = h.service.get_bars(&symbol, Timeframe::D1, &range).await.unwrap();
    assert_eq!(bars.len(), 30);
    let filled: Vec<_> = bars.iter().filter(|b| b.provider == "yahoo").map(|b| b.timestamp).collect();
    assert_eq!(filled, missing.iter().map(|d| midnight_utc(*d)).collect::<Vec<_>>());

    // Not due again until the scan interval passes.
    assert_eq!(h.service.trigger().await.scanned, 0);

    let rescan = h.service.trigger_for(&symbol, Some(Timeframe::D1)).await;
    assert_eq!(rescan.scanned, 1);
    assert_eq!(rescan.chunks_created, 0);
    assert_eq!(rescan.jobs_dispatched, 0);
}

#[tokio::test]
async fn test_partial_session_bar_is_refreshed_after_close() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(100.0));
    // 13:00 in New York: the Mar 1 session is still open.
    let h = harness(config(), &[Arc::clone(&yahoo)], utc(2024, 3, 1, 18)).await;
    let symbol = Symbol::new("X");
    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();
    assert_eq!(h.service.trigger().await.succeeded, 1);

    let mar_1 = daily_window((3, 1), (3, 2));
    let partial = h.service.get_bars(&symbol, Timeframe::D1, &mar_1).await.unwrap();
    assert_eq!(partial[0].fetched_at, utc(2024, 3, 1, 18));

    yahoo.set(Script::Daily(200.0));
    h.clock.advance(Duration::days(3));
    h.service
        .watch(JobDefinition::new(symbol.clone(), Timeframe::D1, 5))
        .await
        .unwrap();

    let scan = h.service.trigger().await;
    assert_eq!(scan.scanned, 1);
    assert!(scan.chunks_created > 0);
    let mut ticks = 1;
    while h.service.trigger().await.jobs_dispatched > 0 {
        ticks += 1;
        assert!(ticks < 10, "refresh did not settle");
    }

    let bars = h.service.get_bars(&symbol, Timeframe::D1, &mar_1).await.unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].close, 200.0);
    assert_eq!(bars[0].fetched_at, utc(2024, 3, 4, 18));

    let rescan = h.service.trigger_for(&symbol, Some(Timeframe::D1)).await;
    assert_eq!(rescan.chunks_created, 0);
}

#[tokio::test]
async fn test_rescan_skips_windows_already_queued() {
    let yahoo = MockProvider::new("yahoo", Script::Throttled);
    let now = utc(2024, 3, 1, 0);
    let h = harness(config(), &[yahoo], now).await;
    let symbol = Symbol::new("X");
    h.service
        .watch(JobDefinition::new(symbol.clone(), Timeframe::D1, 3))
        .await
        .unwrap();

    let first = h.service.trigger_for(&symbol, None).await;
    assert_eq!(first.chunks_created, 3);
    assert_eq!(first.deferred, 3);

    let second = h.service.trigger_for(&symbol, None).await;
    assert_eq!(second.scanned, 1);
    assert_eq!(second.chunks_created, 0);
    assert_eq!(h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_errored_chunks_reseed_after_cooldown() {
    let yahoo = MockProvider::new("yahoo", Script::Down);
    let mut cfg = config();
    cfg.retry = retry(1);
    cfg.scanner = ScannerConfig {
        error_cooldown: std::time::Duration::from_secs(3600),
        ..ScannerConfig::default()
    };
    let h = harness(cfg, &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    h.service
        .watch(JobDefinition::new(symbol.clone(), Timeframe::D1, 1))
        .await
        .unwrap();

    let failed = h.service.trigger().await;
    assert_eq!(failed.chunks_created, 1);
    assert_eq!(failed.failed, 1);

    yahoo.set(Script::Daily(5.0));
    h.clock.advance(Duration::minutes(30));
    let cooling = h.service.trigger_for(&symbol, None).await;
    assert_eq!(cooling.chunks_reseeded, 0);
    assert_eq!(cooling.chunks_created, 0);
    assert_eq!(cooling.jobs_dispatched, 0);

    h.clock.advance(Duration::minutes(45));
    let healed = h.service.trigger_for(&symbol, None).await;
    assert_eq!(healed.chunks_reseeded, 1);
    assert_eq!(healed.succeeded, 1);

    let chunks = h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].status, ChunkStatus::Done);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_late_completion_is_stale() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(7.0));
    let h = harness(config(), &[Arc::clone(&yahoo)], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    h.service.request_backfill(&symbol, Timeframe::D1, 1).await.unwrap();

    let lost = h
        .store
        .claim_next_chunk(None, std::time::Duration::from_secs(300), h.clock.now())
        .await
        .unwrap()
        .unwrap();

    // Leased elsewhere: nothing to claim until the lease expires.
    assert_eq!(h.service.trigger().await.jobs_dispatched, 0);

    h.clock.advance(Duration::minutes(10));
    let summary = h.service.trigger().await;
    assert_eq!(summary.jobs_dispatched, 1);
    assert_eq!(summary.succeeded, 1);

    let late = h
        .store
        .complete_chunk(
            &lost,
            &ChunkOutcome::Failed {
                retryable: true,
                message: "late".to_string(),
            },
            h.clock.now(),
        )
        .await
        .unwrap();
    assert_eq!(late, ChunkTransition::Stale);

    let chunk = &h.store.chunks(&symbol, Timeframe::D1, &[]).await.unwrap()[0];
    assert_eq!(chunk.status, ChunkStatus::Done);
    assert_eq!(chunk.attempts, 0);
    assert_eq!(chunk.last_error, None);
}

#[tokio::test]
async fn test_reads_prefer_latest_fetch() {
    let h = harness(config(), &[], utc(2024, 3, 2, 0)).await;
    let symbol = Symbol::new("X");
    let slot = utc(2024, 3, 1, 0);
    let bar = |provider: &str, close: f64, fetched_hour: u32| {
        backfill::Bar::new(symbol.clone(), Timeframe::D1, slot, close, close, close, close, 1.0)
            .with_provider(provider)
            .with_fetched_at(utc(2024, 3, 1, fetched_hour))
    };
    h.store
        .upsert_bars(&[bar("polygon", 10.0, 22), bar("yahoo", 11.0, 23)])
        .await
        .unwrap();

    let window = daily_window((3, 1), (3, 2));
    let bars = h.service.get_bars(&symbol, Timeframe::D1, &window).await.unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].provider, "yahoo");
    assert_eq!(bars[0].close, 11.0);

    let frame = h.service.get_bars_frame(&symbol, Timeframe::D1, &window).await.unwrap();
    assert_eq!(frame.height(), 1);
}

#[tokio::test]
async fn test_in_memory_store_runs_end_to_end() {
    let yahoo = MockProvider::new("yahoo", Script::Daily(3.0));
    let service = backfill::BackfillService::builder(config())
        .with_store(Arc::new(InMemoryStore::new()))
        .with_provider(yahoo)
        .with_clock(|| utc(2024, 3, 2, 0))
        .build()
        .await
        .unwrap();
    let symbol = Symbol::new("X");

    service.request_backfill(&symbol, Timeframe::D1, 3).await.unwrap();
    let summary = service.trigger().await;
    assert_eq!(summary.succeeded, 3);

    let progress = service.get_job_status(&symbol, Timeframe::D1).await.unwrap();
    assert_eq!(progress.status, Some(JobStatus::Done));
}
