//! Polars export of stored bars.

use backfill_core::{BackfillError, Bar, Result};
use polars::prelude::*;

/// Converts bars into a `DataFrame`.
///
/// Columns: `symbol`, `timeframe`, `timestamp` (UTC milliseconds), `provider`,
/// `open`, `high`, `low`, `close`, `volume`, `fetched_at`.
pub fn bars_to_frame(bars: &[Bar]) -> Result<DataFrame> {
    let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let timeframes: Vec<&str> = bars.iter().map(|b| b.timeframe.as_str()).collect();
    let timestamps: Vec<i64> = bars.iter().map(|b| b.timestamp.timestamp_millis()).collect();
    let providers: Vec<&str> = bars.iter().map(|b| b.provider.as_str()).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let fetched: Vec<i64> = bars.iter().map(|b| b.fetched_at.timestamp_millis()).collect();

    let datetime = DataType::Datetime(TimeUnit::Milliseconds, None);
    let timestamp_col = Column::new("timestamp".into(), timestamps)
        .cast(&datetime)
        .map_err(|e| BackfillError::Other(e.to_string()))?;
    let fetched_col = Column::new("fetched_at".into(), fetched)
        .cast(&datetime)
        .map_err(|e| BackfillError::Other(e.to_string()))?;

    DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("timeframe".into(), timeframes),
        timestamp_col,
        Column::new("provider".into(), providers),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        fetched_col,
    ])
    .map_err(|e| BackfillError::Other(e.to_string()))
}
