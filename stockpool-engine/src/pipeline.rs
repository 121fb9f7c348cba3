//! One pool refresh run.
//!
//! Calendar -> gap detection -> completion -> write -> indicators -> scores
//! -> pool membership. Each stage finishes for every instrument before the
//! next one starts.
//!
//! Only a missing calendar or a storage read/write failure outside pool
//! persistence aborts a run. Vendor outages become fallback provenance,
//! indicator gaps become nulls, incomplete scores freeze the tier and a
//! failed pool write marks just that instrument as failed.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockpool_common::config::{CalendarConfig, Config, SourceKind, VendorConfig};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::data::{
    CalendarError, CompletionFetcher, CompletionReport, DataSource, Field, GapDetector,
    HttpVendor, InstrumentSeries, LocalCache, LocalStorage, LocalStorageConfig, MissingRange,
    SourceChain, SyncStatus, TradingCalendar,
};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::pool::{PoolManager, PoolPolicy, PoolTransition};
use crate::scoring::{ScoreInput, ScoreRecord, ScoringEngine};

// ============================================================================
// Errors
// ============================================================================

/// Failures that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Calendar unavailable: {0}")]
    CalendarUnavailable(#[from] CalendarError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl From<PipelineError> for stockpool_common::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::CalendarUnavailable(e) => Self::CalendarUnavailable(e.to_string()),
            PipelineError::Config(msg) => Self::Config(msg),
            PipelineError::Storage(e) => Self::Storage(format!("{:#}", e)),
        }
    }
}

// ============================================================================
// Run Summary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedInstrument {
    pub instrument: String,
    pub reason: String,
}

/// What one run did, per instrument.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub as_of: NaiveDate,
    /// Latest trading date at or before `as_of`
    pub trading_date: NaiveDate,
    /// No unresolved dates, no fallback fills, no degraded score
    pub fully_updated: Vec<String>,
    /// Unresolved dates, fallback fills or a degraded score
    pub degraded: Vec<String>,
    /// Series or pool persistence failed
    pub failed: Vec<FailedInstrument>,
    pub completion_report: CompletionReport,
    pub transitions: Vec<PoolTransition>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Some instrument failed to persist.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Every component of a run, built once per invocation.
pub struct PoolPipeline {
    storage: Arc<LocalStorage>,
    fetcher: CompletionFetcher,
    indicators: IndicatorEngine,
    scoring: ScoringEngine,
    pools: PoolManager,
    calendar: CalendarConfig,
    max_fill_days: i64,
}

impl PoolPipeline {
    pub fn new(
        storage: Arc<LocalStorage>,
        chain: SourceChain,
        config: &Config,
    ) -> Result<Self, PipelineError> {
        let indicators = IndicatorEngine::from_config(&config.indicators)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let scoring = ScoringEngine::from_config(&config.scoring)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let fields = Field::parse_set(&config.completion.fields).map_err(PipelineError::Config)?;

        let fetcher = CompletionFetcher::new(
            chain,
            fields,
            config.completion.batch_size,
            config.completion.max_workers,
            indicators.lookback(),
        );

        Ok(Self {
            storage,
            fetcher,
            indicators,
            scoring,
            pools: PoolManager::new(PoolPolicy::from(&config.scoring)),
            calendar: config.calendar.clone(),
            max_fill_days: config.completion.max_fill_days,
        })
    }

    /// Open storage and build the source chain from config.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let storage = LocalStorage::new(LocalStorageConfig::from(&config.storage))
            .map_err(PipelineError::Storage)?;
        let chain = Self::build_chain(&config.vendor);
        Self::new(Arc::new(storage), chain, config)
    }

    /// Sources in configured order. A source without its settings is
    /// skipped.
    pub fn build_chain(config: &VendorConfig) -> SourceChain {
        let mut sources = Vec::new();
        for kind in &config.sources {
            match kind {
                SourceKind::PrimaryVendor => match HttpVendor::from_config(config) {
                    Some(vendor) => sources.push(DataSource::PrimaryVendor(Arc::new(vendor))),
                    None => warn!("Primary vendor has no base_url, skipping"),
                },
                SourceKind::LocalCache => match &config.cache_dir {
                    Some(dir) => sources.push(DataSource::LocalCache(LocalCache::new(dir.clone()))),
                    None => warn!("Local cache has no cache_dir, skipping"),
                },
            }
        }
        SourceChain::new(sources, Duration::from_secs(config.timeout_secs))
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Refresh `instruments` as of `as_of`.
    pub async fn run(
        &self,
        instruments: &[String],
        as_of: NaiveDate,
    ) -> Result<RunSummary, PipelineError> {
        let run_id = stockpool_common::logging::generate_run_id();
        let span = stockpool_common::run_span!(run_id, as_of = %as_of);
        self.run_inner(run_id.clone(), instruments, as_of)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        instruments: &[String],
        as_of: NaiveDate,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let instruments: Vec<String> = instruments
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // No writes happen before the calendar is known
        let calendar = TradingCalendar::from_config(&self.calendar, as_of)?;
        let latest = calendar.latest_trading_date(as_of)?;
        info!(instruments = instruments.len(), trading_date = %latest, "Starting pool run");

        // Gap detection and read windows
        let detector = GapDetector::new(&calendar, self.max_fill_days);
        let lookback = self.indicators.lookback();
        let mut series = BTreeMap::new();
        let mut missing = Vec::new();
        for instrument in &instruments {
            let dates = self
                .storage
                .series_dates(instrument)
                .await
                .map_err(PipelineError::Storage)?;
            let range = detector.detect(instrument, &dates, as_of)?;
            let earliest = range.dates.first().copied().unwrap_or(latest).min(latest);
            let read_start = calendar.shift_back(earliest, lookback).unwrap_or(earliest);

            let stored = self
                .storage
                .read_series(instrument, read_start, latest)
                .await
                .map_err(PipelineError::Storage)?;
            series.insert(instrument.clone(), stored);
            missing.push(range);
        }

        // Completion and write-back
        let outcome = self.fetcher.complete(&calendar, series, &missing).await;
        let series = outcome.series;
        let report = outcome.report;
        let mut failed: BTreeMap<String, String> = BTreeMap::new();

        for instrument in &instruments {
            let changed = outcome.changed.get(instrument).map(Vec::as_slice).unwrap_or(&[]);
            let Some(s) = series.get(instrument) else {
                continue;
            };
            if let Err(e) = self.write_changed(instrument, s, changed).await {
                warn!(instrument = %instrument, error = %e, "Failed to write series");
                failed.insert(instrument.clone(), format!("series write failed: {:#}", e));
                continue;
            }
            self.record_sync(instrument, s, &missing, &report)
                .await
                .map_err(PipelineError::Storage)?;
        }

        // Indicators
        let snapshots = self
            .recompute_indicators(&calendar, &instruments, &series, &outcome.changed, &failed, latest)
            .await?;

        // Scores
        let scores = self
            .score(&instruments, &series, &snapshots, &failed, latest)
            .await?;

        // Pools
        let mut book = self.storage.read_pool_book().await.map_err(PipelineError::Storage)?;
        let transitions = self.pools.evaluate(&mut book, &scores, &calendar, latest);
        let persistence = self
            .storage
            .write_pool_book(&book)
            .await
            .map_err(PipelineError::Storage)?;
        for err in persistence {
            warn!(instrument = %err.instrument, reason = %err.reason, "Pool persistence failed");
            failed.insert(err.instrument.clone(), err.to_string());
        }

        let transitions: Vec<PoolTransition> = transitions
            .into_iter()
            .filter(|t| !failed.contains_key(&t.instrument))
            .collect();
        self.storage
            .append_transitions(&transitions)
            .await
            .map_err(PipelineError::Storage)?;

        // Summary
        let degraded_scores: BTreeSet<&str> = scores
            .iter()
            .filter(|s| s.degraded)
            .map(|s| s.instrument.as_str())
            .collect();
        let mut fully_updated = Vec::new();
        let mut degraded = Vec::new();
        for instrument in &instruments {
            if failed.contains_key(instrument) {
                continue;
            }
            let clean = report.get(instrument).map_or(true, |c| c.is_clean());
            if clean && !degraded_scores.contains(instrument.as_str()) {
                fully_updated.push(instrument.clone());
            } else {
                degraded.push(instrument.clone());
            }
        }

        let summary = RunSummary {
            run_id,
            as_of,
            trading_date: latest,
            fully_updated,
            degraded,
            failed: failed
                .into_iter()
                .map(|(instrument, reason)| FailedInstrument { instrument, reason })
                .collect(),
            completion_report: report,
            transitions,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            fully_updated = summary.fully_updated.len(),
            degraded = summary.degraded.len(),
            failed = summary.failed.len(),
            transitions = summary.transitions.len(),
            duration_ms = summary.duration_ms,
            "Pool run complete"
        );
        Ok(summary)
    }

    async fn write_changed(
        &self,
        instrument: &str,
        series: &InstrumentSeries,
        changed: &[NaiveDate],
    ) -> anyhow::Result<usize> {
        let rows: Vec<_> = changed
            .iter()
            .filter_map(|d| series.get(d).map(|row| (*d, row.clone())))
            .collect();
        self.storage.write_series(instrument, &rows).await
    }

    async fn record_sync(
        &self,
        instrument: &str,
        series: &InstrumentSeries,
        missing: &[MissingRange],
        report: &CompletionReport,
    ) -> anyhow::Result<()> {
        let had_gaps = missing
            .iter()
            .any(|m| m.instrument == instrument && !m.is_empty());
        let unresolved = report
            .get(instrument)
            .map(|c| c.unresolved().len())
            .unwrap_or(0);

        let (status, message) = if series.is_empty() {
            (SyncStatus::Failed, Some("no rows available".to_string()))
        } else if unresolved > 0 {
            (SyncStatus::Partial, Some(format!("{} unresolved date(s)", unresolved)))
        } else {
            (SyncStatus::Synced, None)
        };

        if had_gaps || series.is_empty() {
            debug!(instrument, status = %status, unresolved, "Updating sync metadata");
        }
        self.storage
            .update_sync_metadata(instrument, series.last_date(), status, message.as_deref())
            .await
    }

    /// Recompute from the earliest changed date, plus the trading date when
    /// it has no stored snapshot yet. Returns the trading-date snapshots.
    async fn recompute_indicators(
        &self,
        calendar: &TradingCalendar,
        instruments: &[String],
        series: &BTreeMap<String, InstrumentSeries>,
        changed: &BTreeMap<String, Vec<NaiveDate>>,
        failed: &BTreeMap<String, String>,
        latest: NaiveDate,
    ) -> Result<BTreeMap<String, IndicatorSnapshot>, PipelineError> {
        let mut work = Vec::new();
        let mut latest_snapshots = BTreeMap::new();
        let names = self.indicators.names();

        for instrument in instruments {
            if failed.contains_key(instrument) {
                continue;
            }
            let Some(s) = series.get(instrument) else {
                continue;
            };
            let mut dates = changed.get(instrument).cloned().unwrap_or_default();

            if s.contains(&latest) {
                match self
                    .storage
                    .read_indicators(instrument, latest)
                    .await
                    .map_err(PipelineError::Storage)?
                {
                    // Reusable only if it covers the whole current catalogue
                    Some(mut stored)
                        if dates.is_empty()
                            && names.iter().all(|n| stored.values.contains_key(n)) =>
                    {
                        stored.values.retain(|name, _| names.contains(name));
                        latest_snapshots.insert(instrument.clone(), stored);
                    }
                    _ => dates.push(latest),
                }
            }
            if !dates.is_empty() {
                work.push((s, dates));
            }
        }

        let recomputed = self.indicators.recompute_all(calendar, &work);
        let all: Vec<IndicatorSnapshot> = recomputed.into_values().flatten().collect();
        self.storage
            .write_indicators(&all)
            .await
            .map_err(PipelineError::Storage)?;

        for snapshot in all {
            if snapshot.date == latest {
                latest_snapshots.insert(snapshot.instrument.clone(), snapshot);
            }
        }
        Ok(latest_snapshots)
    }

    async fn score(
        &self,
        instruments: &[String],
        series: &BTreeMap<String, InstrumentSeries>,
        snapshots: &BTreeMap<String, IndicatorSnapshot>,
        failed: &BTreeMap<String, String>,
        latest: NaiveDate,
    ) -> Result<Vec<ScoreRecord>, PipelineError> {
        let inputs: Vec<ScoreInput<'_>> = instruments
            .iter()
            .filter(|i| !failed.contains_key(*i))
            .map(|i| ScoreInput {
                instrument: i,
                latest_row: series.get(i).and_then(|s| s.get(&latest)),
                snapshot: snapshots.get(i),
            })
            .collect();

        let scores = self.scoring.score_all(latest, &inputs);
        for record in &scores {
            if record.degraded {
                warn!(
                    instrument = %record.instrument,
                    missing = ?record.missing_inputs,
                    "Degraded score"
                );
            }
            self.storage
                .append_score(record)
                .await
                .map_err(PipelineError::Storage)?;
        }
        Ok(scores)
    }
}
