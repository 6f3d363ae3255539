use async_trait::async_trait;
use backfill_core::{
    AssetClass, BackfillError, CoverageRegistry, JobDefinition, Result, Symbol, SymbolRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, instrument};

use super::{SqliteStore, millis, opt_millis, opt_ts_col, parse_col, store_err, ts_col};

const DEFINITION_COLUMNS: &str =
    "id, symbol, timeframe, enabled, priority, lookback_sessions, last_scanned_at";

fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    Ok(JobDefinition {
        id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        timeframe: parse_col(row, 2)?,
        enabled: row.get(3)?,
        priority: row.get(4)?,
        lookback_sessions: row.get(5)?,
        last_scanned_at: opt_ts_col(row, 6)?,
    })
}

fn symbol_from_row(row: &Row<'_>) -> rusqlite::Result<SymbolRecord> {
    Ok(SymbolRecord {
        id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        asset_class: parse_col::<AssetClass>(row, 2)?,
        created_at: ts_col(row, 3)?,
    })
}

#[async_trait]
impl CoverageRegistry for SqliteStore {
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn register_symbol(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        now: DateTime<Utc>,
    ) -> Result<SymbolRecord> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT INTO symbols (symbol, asset_class, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (symbol) DO NOTHING",
                params![symbol.as_str(), asset_class.as_str(), millis(now)],
            )
            .map_err(store_err)?;
        if inserted > 0 {
            debug!("Registered symbol");
        }

        conn.query_row(
            "SELECT id, symbol, asset_class, created_at FROM symbols WHERE symbol = ?1",
            params![symbol.as_str()],
            symbol_from_row,
        )
        .map_err(store_err)
    }

    async fn symbol(&self, symbol: &Symbol) -> Result<Option<SymbolRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, symbol, asset_class, created_at FROM symbols WHERE symbol = ?1",
            params![symbol.as_str()],
            symbol_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    #[instrument(skip(self, definition), fields(symbol = %definition.symbol, timeframe = %definition.timeframe))]
    async fn upsert_definition(
        &self,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<JobDefinition> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "INSERT INTO job_definitions
                 (symbol, timeframe, enabled, priority, lookback_sessions, last_scanned_at,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (symbol, timeframe) DO UPDATE SET
                    enabled = excluded.enabled,
                    priority = excluded.priority,
                    lookback_sessions = excluded.lookback_sessions,
                    updated_at = excluded.updated_at
                 RETURNING {DEFINITION_COLUMNS}"
            ),
            params![
                definition.symbol.as_str(),
                definition.timeframe.as_str(),
                definition.enabled,
                definition.priority,
                definition.lookback_sessions,
                opt_millis(definition.last_scanned_at),
                millis(now),
            ],
            definition_from_row,
        )
        .map_err(store_err)
    }

    async fn definitions(&self, enabled_only: bool) -> Result<Vec<JobDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM job_definitions
                 WHERE ?1 = 0 OR enabled = 1
                 ORDER BY priority DESC, id ASC"
            ))
            .map_err(store_err)?;
        let definitions = stmt
            .query_map(params![enabled_only], definition_from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(definitions)
    }

    async fn mark_scanned(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE job_definitions SET last_scanned_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, millis(at)],
            )
            .map_err(store_err)?;
        if updated == 0 {
            return Err(BackfillError::InvalidParameter(format!(
                "Unknown job definition: {id}"
            )));
        }
        Ok(())
    }
}
