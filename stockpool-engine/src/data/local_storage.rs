//! Local stock pool storage using SQLite.
//!
//! Provides persistent storage for:
//! - Daily rows per instrument (with provenance)
//! - Indicator snapshots
//! - Append-only score history
//! - Pool membership and the transition log
//! - Per-instrument sync metadata
//!
//! Daily rows are upserted by (instrument, date) and never deleted. The
//! completion stage only ever hands over rows for dates that were missing,
//! so settled rows are not rewritten in practice.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use stockpool_common::config::StorageConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{DailyRow, Field, InstrumentSeries, RowSource};
use crate::indicators::IndicatorSnapshot;
use crate::pool::{
    Pool, PoolBook, PoolMember, PoolPersistenceError, PoolTransition, Tier, TransitionReason,
};
use crate::scoring::ScoreRecord;

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Daily rows table
CREATE TABLE IF NOT EXISTS daily_rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume REAL,
    turnover REAL,
    pe_ratio REAL,
    pb_ratio REAL,
    market_cap REAL,
    turnover_rate REAL,
    source TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(instrument, date)
);

CREATE INDEX IF NOT EXISTS idx_daily_rows_instrument_date
ON daily_rows(instrument, date);

-- Indicator values table
CREATE TABLE IF NOT EXISTS indicator_values (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument TEXT NOT NULL,
    date TEXT NOT NULL,
    name TEXT NOT NULL,
    value REAL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(instrument, date, name)
);

CREATE INDEX IF NOT EXISTS idx_indicator_values_instrument_date
ON indicator_values(instrument, date);

-- Score history table (append-only)
CREATE TABLE IF NOT EXISTS score_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument TEXT NOT NULL,
    as_of TEXT NOT NULL,
    composite_score REAL NOT NULL,
    component_scores_json TEXT NOT NULL,
    inputs_hash TEXT NOT NULL,
    missing_inputs_json TEXT NOT NULL,
    degraded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(instrument, as_of, inputs_hash)
);

CREATE INDEX IF NOT EXISTS idx_score_history_instrument_as_of
ON score_history(instrument, as_of DESC);

-- Pool membership table
CREATE TABLE IF NOT EXISTS pool_members (
    instrument TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    entered_at TEXT NOT NULL,
    last_score REAL NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_pool_members_tier
ON pool_members(tier);

-- Pool transition log
CREATE TABLE IF NOT EXISTS pool_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument TEXT NOT NULL,
    from_tier TEXT NOT NULL,
    to_tier TEXT NOT NULL,
    score REAL NOT NULL,
    date TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_pool_transitions_instrument_date
ON pool_transitions(instrument, date DESC);

-- Sync metadata table
CREATE TABLE IF NOT EXISTS sync_metadata (
    instrument TEXT PRIMARY KEY,
    last_date TEXT,
    last_sync_at TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    error_message TEXT
);
"#;

const DAILY_COLUMNS: &str = "date, open, high, low, close, volume, turnover, pe_ratio, pb_ratio, \
                             market_cap, turnover_rate, source";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for local storage
#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    /// Path to SQLite database
    pub db_path: PathBuf,
    /// Whether local storage is enabled
    pub enabled: bool,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".stockpool")
                .join("stockpool.db"),
            enabled: true,
        }
    }
}

impl From<&StorageConfig> for LocalStorageConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            db_path: config.db_path.clone(),
            enabled: true,
        }
    }
}

// ============================================================================
// Sync Status
// ============================================================================

/// Outcome of the last sync for an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every expected date is present
    Synced,
    /// Some dates are still unresolved
    Partial,
    /// Nothing could be stored
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl SyncStatus {
    fn from_str(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "partial" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

/// Sync metadata record
#[derive(Debug, Clone)]
pub struct SyncMetadata {
    pub instrument: String,
    /// Latest stored trading date
    pub last_date: Option<NaiveDate>,
    pub last_sync_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
}

// ============================================================================
// Local Storage
// ============================================================================

/// Local SQLite storage for the stock pool engine
pub struct LocalStorage {
    /// SQLite connection wrapped in Mutex: rusqlite::Connection is Send but
    /// not Sync
    db: Arc<Mutex<Connection>>,
    config: LocalStorageConfig,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    pub fn new(config: LocalStorageConfig) -> Result<Self> {
        if !config.enabled {
            return Err(anyhow::anyhow!("Local storage is disabled"));
        }

        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.db_path)
            .context("Failed to open local storage database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;

        info!(db_path = %config.db_path.display(), "Initialized local storage");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(LocalStorageConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.config.db_path
    }

    // ========================================================================
    // Daily Row Operations
    // ========================================================================

    /// Read rows for `[start, end]` into a series.
    pub async fn read_series(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<InstrumentSeries> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM daily_rows WHERE instrument = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date",
            DAILY_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![instrument, start.to_string(), end.to_string()],
                Self::row_to_daily,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read series for {}", instrument))?;

        Ok(InstrumentSeries::from_rows(instrument, rows))
    }

    fn row_to_daily(row: &rusqlite::Row) -> rusqlite::Result<(NaiveDate, DailyRow)> {
        let date = parse_date(&row.get::<_, String>(0)?)?;
        let source: String = row.get(11)?;
        let mut daily = DailyRow::empty(RowSource::from_tag(&source));
        for (i, field) in Field::ALL.iter().enumerate() {
            daily.set(*field, row.get::<_, Option<f64>>(i + 1)?);
        }
        Ok((date, daily))
    }

    /// Every stored date of an instrument.
    pub async fn series_dates(&self, instrument: &str) -> Result<BTreeSet<NaiveDate>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT date FROM daily_rows WHERE instrument = ?1")?;
        let dates = stmt
            .query_map(params![instrument], |row| parse_date(&row.get::<_, String>(0)?))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(dates)
    }

    /// Upsert rows by date key in one transaction. Never deletes.
    pub async fn write_series(
        &self,
        instrument: &str,
        rows: &[(NaiveDate, DailyRow)],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO daily_rows
                (instrument, date, open, high, low, close, volume, turnover,
                 pe_ratio, pb_ratio, market_cap, turnover_rate, source)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(instrument, date) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume,
                    turnover = excluded.turnover, pe_ratio = excluded.pe_ratio,
                    pb_ratio = excluded.pb_ratio, market_cap = excluded.market_cap,
                    turnover_rate = excluded.turnover_rate, source = excluded.source
                "#,
            )?;
            for (date, row) in rows {
                stmt.execute(params![
                    instrument,
                    date.to_string(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                    row.turnover,
                    row.pe_ratio,
                    row.pb_ratio,
                    row.market_cap,
                    row.turnover_rate,
                    row.source.to_tag(),
                ])
                .with_context(|| format!("Failed to write {} {}", instrument, date))?;
            }
        }
        tx.commit()?;

        debug!(instrument, count = rows.len(), "Saved daily rows to local storage");
        Ok(rows.len())
    }

    /// Instruments with stored rows or pool membership.
    pub async fn list_instruments(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT instrument FROM daily_rows UNION SELECT instrument FROM pool_members ORDER BY 1",
        )?;
        let instruments = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(instruments)
    }

    // ========================================================================
    // Indicator Operations
    // ========================================================================

    /// Upsert snapshots; a null value is stored as NULL.
    pub async fn write_indicators(&self, snapshots: &[IndicatorSnapshot]) -> Result<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO indicator_values (instrument, date, name, value, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(instrument, date, name) DO UPDATE SET
                    value = excluded.value, updated_at = excluded.updated_at
                "#,
            )?;
            let now = Utc::now().to_rfc3339();
            for snapshot in snapshots {
                for (name, value) in &snapshot.values {
                    stmt.execute(params![
                        snapshot.instrument,
                        snapshot.date.to_string(),
                        name,
                        value,
                        now
                    ])?;
                    count += 1;
                }
            }
        }
        tx.commit()?;

        debug!(snapshots = snapshots.len(), values = count, "Saved indicator values");
        Ok(count)
    }

    pub async fn read_indicators(
        &self,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<IndicatorSnapshot>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT name, value FROM indicator_values WHERE instrument = ?1 AND date = ?2",
        )?;
        let values = stmt
            .query_map(params![instrument, date.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(IndicatorSnapshot {
            instrument: instrument.to_string(),
            date,
            values,
        }))
    }

    // ========================================================================
    // Score History Operations
    // ========================================================================

    /// Append a score. Returns `false` when the same inputs were already
    /// scored for that date.
    pub async fn append_score(&self, record: &ScoreRecord) -> Result<bool> {
        let db = self.db.lock().await;
        let inserted = db.execute(
            r#"
            INSERT OR IGNORE INTO score_history
            (instrument, as_of, composite_score, component_scores_json, inputs_hash,
             missing_inputs_json, degraded)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.instrument,
                record.as_of.to_string(),
                record.composite_score,
                serde_json::to_string(&record.component_scores)?,
                record.inputs_hash,
                serde_json::to_string(&record.missing_inputs)?,
                record.degraded,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Most recent scores first.
    pub async fn score_history(&self, instrument: &str, limit: usize) -> Result<Vec<ScoreRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT instrument, as_of, composite_score, component_scores_json, inputs_hash,
                   missing_inputs_json, degraded
            FROM score_history WHERE instrument = ?1
            ORDER BY as_of DESC, id DESC LIMIT ?2
            "#,
        )?;
        let records = stmt
            .query_map(params![instrument, limit as i64], Self::row_to_score)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn row_to_score(row: &rusqlite::Row) -> rusqlite::Result<ScoreRecord> {
        let components: String = row.get(3)?;
        let missing: String = row.get(5)?;
        Ok(ScoreRecord {
            instrument: row.get(0)?,
            as_of: parse_date(&row.get::<_, String>(1)?)?,
            composite_score: row.get(2)?,
            component_scores: serde_json::from_str(&components).unwrap_or_default(),
            inputs_hash: row.get(4)?,
            missing_inputs: serde_json::from_str(&missing).unwrap_or_default(),
            degraded: row.get(6)?,
        })
    }

    // ========================================================================
    // Pool Operations
    // ========================================================================

    pub async fn read_pool(&self, tier: Tier) -> Result<Pool> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT instrument, entered_at, last_score FROM pool_members WHERE tier = ?1 ORDER BY instrument",
        )?;
        let members = stmt
            .query_map(params![tier.as_str()], |row| {
                Ok(PoolMember {
                    instrument: row.get(0)?,
                    entered_at: parse_date(&row.get::<_, String>(1)?)?,
                    last_score: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pool::from_members(tier, members))
    }

    pub async fn read_pool_book(&self) -> Result<PoolBook> {
        let mut pools = Vec::with_capacity(Tier::POOLS.len());
        for tier in Tier::POOLS {
            pools.push(self.read_pool(tier).await?);
        }
        Ok(PoolBook::from_pools(pools))
    }

    /// Replace the stored members of one tier. Each instrument is written
    /// on its own; failures are returned per instrument.
    pub async fn write_pool(&self, tier: Tier, pool: &Pool) -> Result<Vec<PoolPersistenceError>> {
        let db = self.db.lock().await;
        let mut failures = Self::upsert_members(&db, tier, pool);

        let stored = Self::stored_members(&db, Some(tier))?;
        for instrument in stored.iter().filter(|i| !pool.contains(i)) {
            if let Err(e) = Self::delete_member(&db, instrument) {
                failures.push(e);
            }
        }
        Ok(failures)
    }

    /// Persist the whole book: upsert every member, then drop rows of
    /// instruments that are now unranked.
    pub async fn write_pool_book(&self, book: &PoolBook) -> Result<Vec<PoolPersistenceError>> {
        let db = self.db.lock().await;
        let mut failures = Vec::new();
        for pool in book.pools() {
            failures.extend(Self::upsert_members(&db, pool.tier, pool));
        }

        let stored = Self::stored_members(&db, None)?;
        for instrument in stored
            .iter()
            .filter(|i| book.tier_of(i) == Tier::Unranked)
        {
            if let Err(e) = Self::delete_member(&db, instrument) {
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            warn!(failed = failures.len(), "Some pool members could not be persisted");
        }
        Ok(failures)
    }

    fn upsert_members(db: &Connection, tier: Tier, pool: &Pool) -> Vec<PoolPersistenceError> {
        let now = Utc::now().to_rfc3339();
        pool.members()
            .filter_map(|member| {
                db.execute(
                    r#"
                    INSERT INTO pool_members (instrument, tier, entered_at, last_score, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(instrument) DO UPDATE SET
                        tier = excluded.tier, entered_at = excluded.entered_at,
                        last_score = excluded.last_score, updated_at = excluded.updated_at
                    "#,
                    params![
                        member.instrument,
                        tier.as_str(),
                        member.entered_at.to_string(),
                        member.last_score,
                        now
                    ],
                )
                .err()
                .map(|e| PoolPersistenceError {
                    instrument: member.instrument.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn stored_members(db: &Connection, tier: Option<Tier>) -> Result<Vec<String>> {
        let instruments = match tier {
            Some(tier) => {
                let mut stmt = db.prepare("SELECT instrument FROM pool_members WHERE tier = ?1")?;
                let rows = stmt
                    .query_map(params![tier.as_str()], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
            None => {
                let mut stmt = db.prepare("SELECT instrument FROM pool_members")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
        };
        Ok(instruments)
    }

    fn delete_member(db: &Connection, instrument: &str) -> Result<(), PoolPersistenceError> {
        db.execute(
            "DELETE FROM pool_members WHERE instrument = ?1",
            params![instrument],
        )
        .map(|_| ())
        .map_err(|e| PoolPersistenceError {
            instrument: instrument.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn append_transitions(&self, transitions: &[PoolTransition]) -> Result<usize> {
        if transitions.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO pool_transitions (instrument, from_tier, to_tier, score, date, reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for t in transitions {
                stmt.execute(params![
                    t.instrument,
                    t.from.as_str(),
                    t.to.as_str(),
                    t.score,
                    t.date.to_string(),
                    t.reason.as_str(),
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = transitions.len(), "Saved pool transitions");
        Ok(transitions.len())
    }

    /// Latest transitions first, optionally for one instrument.
    pub async fn recent_transitions(
        &self,
        instrument: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PoolTransition>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT instrument, from_tier, to_tier, score, date, reason
            FROM pool_transitions
            WHERE ?1 IS NULL OR instrument = ?1
            ORDER BY date DESC, id DESC LIMIT ?2
            "#,
        )?;
        let transitions = stmt
            .query_map(params![instrument, limit as i64], Self::row_to_transition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(transitions)
    }

    fn row_to_transition(row: &rusqlite::Row) -> rusqlite::Result<PoolTransition> {
        let from: String = row.get(1)?;
        let to: String = row.get(2)?;
        let reason: String = row.get(5)?;
        Ok(PoolTransition {
            instrument: row.get(0)?,
            from: Tier::from_str(&from).unwrap_or(Tier::Unranked),
            to: Tier::from_str(&to).unwrap_or(Tier::Unranked),
            score: row.get(3)?,
            date: parse_date(&row.get::<_, String>(4)?)?,
            reason: TransitionReason::from_str(&reason).unwrap_or(TransitionReason::Demotion),
        })
    }

    // ========================================================================
    // Sync Metadata Operations
    // ========================================================================

    pub async fn get_sync_metadata(&self, instrument: &str) -> Result<Option<SyncMetadata>> {
        let db = self.db.lock().await;
        let meta = db
            .query_row(
                "SELECT instrument, last_date, last_sync_at, sync_status, error_message
                 FROM sync_metadata WHERE instrument = ?1",
                params![instrument],
                |row| {
                    let last_date: Option<String> = row.get(1)?;
                    let last_sync_str: String = row.get(2)?;
                    let status_str: String = row.get(3)?;
                    Ok(SyncMetadata {
                        instrument: row.get(0)?,
                        last_date: last_date.and_then(|s| s.parse().ok()),
                        last_sync_at: DateTime::parse_from_rfc3339(&last_sync_str)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        sync_status: SyncStatus::from_str(&status_str),
                        error_message: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub async fn update_sync_metadata(
        &self,
        instrument: &str,
        last_date: Option<NaiveDate>,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO sync_metadata
            (instrument, last_date, last_sync_at, sync_status, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                instrument,
                last_date.map(|d| d.to_string()),
                Utc::now().to_rfc3339(),
                status.to_string(),
                error_message,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Maintenance Operations
    // ========================================================================

    /// Get database statistics
    pub async fn get_stats(&self) -> Result<LocalStorageStats> {
        let db = self.db.lock().await;
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = db.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let stats = LocalStorageStats {
            row_count: count("SELECT COUNT(*) FROM daily_rows")?,
            instrument_count: count("SELECT COUNT(DISTINCT instrument) FROM daily_rows")?,
            indicator_count: count("SELECT COUNT(*) FROM indicator_values")?,
            score_count: count("SELECT COUNT(*) FROM score_history")?,
            pool_member_count: count("SELECT COUNT(*) FROM pool_members")?,
            transition_count: count("SELECT COUNT(*) FROM pool_transitions")?,
            db_size_bytes: std::fs::metadata(&self.config.db_path)
                .map(|m| m.len())
                .unwrap_or(0),
        };
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch_for_test(&self, sql: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(sql)?;
        Ok(())
    }
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    s.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Statistics about local storage
#[derive(Debug, Clone)]
pub struct LocalStorageStats {
    pub row_count: u64,
    pub instrument_count: u64,
    pub indicator_count: u64,
    pub score_count: u64,
    pub pool_member_count: u64,
    pub transition_count: u64,
    pub db_size_bytes: u64,
}

impl std::fmt::Display for LocalStorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LocalStorage: {} rows ({} instruments), {} indicator values, {} scores, {} pool members, {} transitions ({:.2} MB)",
            self.row_count,
            self.instrument_count,
            self.indicator_count,
            self.score_count,
            self.pool_member_count,
            self.transition_count,
            self.db_size_bytes as f64 / 1_048_576.0
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
