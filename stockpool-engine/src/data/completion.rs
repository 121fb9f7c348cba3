//! Completion of missing daily rows.
//!
//! Missing ranges are grouped by identical `(start, end)` span, chunked to
//! `batch_size` instruments and fetched through the source chain with at
//! most `max_workers` calls in flight. Batches touch disjoint instruments,
//! so results are merged afterwards by a single writer.
//!
//! # Merge Rules
//! - Rows are merged only at dates that are currently missing; a present
//!   date (even a partially null one) is never replaced
//! - Rows at dates outside the missing set are ignored
//!
//! # Fallback Chain
//! When every source fails for a batch, or a later source answers after a
//! failover without any row for an instrument, each missing date of the
//! affected instruments goes through:
//! 1. Linear interpolation between the nearest earlier and later vendor rows
//!    within the lookback window
//! 2. Forward fill from the nearest earlier vendor row within the window
//! 3. Left absent, retried on the next run

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use super::calendar::TradingCalendar;
use super::gap::MissingRange;
use super::vendor::{ChainError, FetchOutcome, SourceChain};
use super::{DailyRow, Field, InstrumentSeries, RowSource};

// ============================================================================
// Report
// ============================================================================

/// How a missing date was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FillMethod {
    /// Returned by a source
    Vendor { source: String },
    /// Interpolated between two vendor rows
    Interpolated,
    /// Copied from the vendor row at `from`
    ForwardFilled { from: NaiveDate },
    /// Every source failed and no anchor was in range; date left absent
    NoFallbackAvailable,
    /// A source answered without a row for this date; date left absent
    NotReturned,
}

impl FillMethod {
    /// The date now has a row.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Vendor { .. } | Self::Interpolated | Self::ForwardFilled { .. }
        )
    }

    /// The row was synthesised rather than fetched.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Interpolated | Self::ForwardFilled { .. })
    }
}

/// One (date, method) audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub method: FillMethod,
}

/// Completion audit for one instrument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentCompletion {
    pub records: Vec<FillRecord>,
    /// Sources that failed for this instrument's batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_sources: Vec<String>,
    /// Data quality in `[0, 1]`
    pub quality_score: f64,
}

impl InstrumentCompletion {
    pub fn unresolved(&self) -> Vec<NaiveDate> {
        self.records
            .iter()
            .filter(|r| !r.method.is_resolved())
            .map(|r| r.date)
            .collect()
    }

    pub fn fallback_count(&self) -> usize {
        self.records.iter().filter(|r| r.method.is_fallback()).count()
    }

    /// Every missing date was filled straight from a source.
    pub fn is_clean(&self) -> bool {
        self.records
            .iter()
            .all(|r| matches!(r.method, FillMethod::Vendor { .. }))
    }
}

/// Per-run completion audit, keyed by instrument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionReport {
    pub instruments: BTreeMap<String, InstrumentCompletion>,
}

impl CompletionReport {
    fn record(&mut self, instrument: &str, date: NaiveDate, method: FillMethod) {
        self.instruments
            .entry(instrument.to_string())
            .or_default()
            .records
            .push(FillRecord { date, method });
    }

    pub fn get(&self, instrument: &str) -> Option<&InstrumentCompletion> {
        self.instruments.get(instrument)
    }

    /// Records across every instrument.
    pub fn total_records(&self) -> usize {
        self.instruments.values().map(|c| c.records.len()).sum()
    }

    /// Merge another report (e.g. from a different instrument subset).
    pub fn extend(&mut self, other: CompletionReport) {
        self.instruments.extend(other.instruments);
    }
}

/// Data quality score of a series after completion.
///
/// `0.7 * (1 - unresolved / expected) + 0.3 * continuity`, where continuity
/// is the share of consecutive present dates at most 3 calendar days apart.
pub fn quality_score(series: &InstrumentSeries, unresolved: usize) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let expected = series.len() + unresolved;
    let completeness = 1.0 - unresolved as f64 / expected as f64;

    let dates: Vec<NaiveDate> = series.dates().into_iter().collect();
    let continuity = if dates.len() < 2 {
        1.0
    } else {
        let continuous = dates
            .windows(2)
            .filter(|w| (w[1] - w[0]).num_days() <= 3)
            .count();
        continuous as f64 / (dates.len() - 1) as f64
    };

    completeness * 0.7 + continuity * 0.3
}

// ============================================================================
// Fetcher
// ============================================================================

/// One vendor call: instruments sharing a missing span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub instruments: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Result of a completion pass.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// Input series with resolved dates merged in
    pub series: BTreeMap<String, InstrumentSeries>,
    pub report: CompletionReport,
    /// Dates inserted this pass, ascending, per instrument
    pub changed: BTreeMap<String, Vec<NaiveDate>>,
}

/// Batched backfill through a [`SourceChain`].
pub struct CompletionFetcher {
    chain: SourceChain,
    fields: Vec<Field>,
    batch_size: usize,
    max_workers: usize,
    /// Fallback anchor window in trading days
    lookback: usize,
}

impl CompletionFetcher {
    pub fn new(
        chain: SourceChain,
        fields: Vec<Field>,
        batch_size: usize,
        max_workers: usize,
        lookback: usize,
    ) -> Self {
        Self {
            chain,
            fields,
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
            lookback,
        }
    }

    /// Group non-empty missing ranges by span and chunk each group.
    pub fn plan_batches(missing: &[MissingRange], batch_size: usize) -> Vec<Batch> {
        let mut by_span: BTreeMap<(NaiveDate, NaiveDate), Vec<String>> = BTreeMap::new();
        for range in missing {
            if let Some(span) = range.span() {
                by_span.entry(span).or_default().push(range.instrument.clone());
            }
        }

        let mut batches = Vec::new();
        for ((start, end), mut instruments) in by_span {
            instruments.sort();
            instruments.dedup();
            for chunk in instruments.chunks(batch_size.max(1)) {
                batches.push(Batch {
                    instruments: chunk.to_vec(),
                    start,
                    end,
                });
            }
        }
        batches
    }

    /// Fill `missing` dates into `series`.
    ///
    /// Instruments absent from `series` start empty. Instruments without a
    /// missing range pass through untouched.
    pub async fn complete(
        &self,
        calendar: &TradingCalendar,
        mut series: BTreeMap<String, InstrumentSeries>,
        missing: &[MissingRange],
    ) -> CompletionOutcome {
        let mut report = CompletionReport::default();
        let mut changed: BTreeMap<String, Vec<NaiveDate>> = BTreeMap::new();

        let missing_by: HashMap<&str, &MissingRange> = missing
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| (m.instrument.as_str(), m))
            .collect();

        let batches = Self::plan_batches(missing, self.batch_size);
        info!(
            instruments = missing_by.len(),
            batches = batches.len(),
            max_workers = self.max_workers,
            "Starting completion"
        );

        let chain = &self.chain;
        let fields = self.fields.as_slice();
        let mut results: Vec<(Batch, Result<FetchOutcome, ChainError>)> = stream::iter(batches)
            .map(|batch| async move {
                let result = chain
                    .fetch(&batch.instruments, batch.start, batch.end, fields)
                    .await;
                (batch, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;
        results.sort_by(|a, b| {
            (a.0.start, &a.0.instruments).cmp(&(b.0.start, &b.0.instruments))
        });

        for (batch, result) in results {
            match result {
                Ok(outcome) => {
                    // After a failover, an instrument the answering source
                    // has nothing for is as unavailable as a failed call
                    let answered: HashSet<&str> =
                        outcome.rows.iter().map(|r| r.instrument.as_str()).collect();
                    let (served, unserved): (Vec<String>, Vec<String>) =
                        batch.instruments.iter().cloned().partition(|i| {
                            outcome.failed_attempts.is_empty()
                                || answered.contains(i.as_str())
                        });

                    if !outcome.failed_attempts.is_empty() {
                        for instrument in &batch.instruments {
                            report
                                .instruments
                                .entry(instrument.clone())
                                .or_default()
                                .failed_sources
                                .extend(outcome.failed_attempts.iter().map(|a| a.source.clone()));
                        }
                    }

                    self.merge_fetched(
                        &served,
                        &outcome,
                        &missing_by,
                        &mut series,
                        &mut report,
                        &mut changed,
                    );
                    if !unserved.is_empty() {
                        warn!(
                            instruments = unserved.len(),
                            source = %outcome.source,
                            start = %batch.start,
                            end = %batch.end,
                            "Fallback source had no rows, applying fallback chain"
                        );
                        self.fallback_batch(
                            calendar,
                            &unserved,
                            &missing_by,
                            &mut series,
                            &mut report,
                            &mut changed,
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        instruments = batch.instruments.len(),
                        start = %batch.start,
                        end = %batch.end,
                        error = %err,
                        "Every source failed, applying fallback chain"
                    );
                    for instrument in &batch.instruments {
                        report
                            .instruments
                            .entry(instrument.clone())
                            .or_default()
                            .failed_sources
                            .extend(err.attempts.iter().map(|a| a.source.clone()));
                    }
                    self.fallback_batch(
                        calendar,
                        &batch.instruments,
                        &missing_by,
                        &mut series,
                        &mut report,
                        &mut changed,
                    );
                }
            }
        }

        // Quality for every instrument seen this pass
        let instruments: Vec<String> = series
            .keys()
            .cloned()
            .chain(missing_by.keys().map(|k| k.to_string()))
            .collect();
        for instrument in instruments {
            let entry = report.instruments.entry(instrument.clone()).or_default();
            let unresolved = entry.unresolved().len();
            entry.quality_score = series
                .get(&instrument)
                .map(|s| quality_score(s, unresolved))
                .unwrap_or(0.0);
        }
        for dates in changed.values_mut() {
            dates.sort();
        }

        info!(
            records = report.total_records(),
            changed = changed.values().map(Vec::len).sum::<usize>(),
            "Completion finished"
        );

        CompletionOutcome {
            series,
            report,
            changed,
        }
    }

    fn merge_fetched(
        &self,
        instruments: &[String],
        outcome: &FetchOutcome,
        missing_by: &HashMap<&str, &MissingRange>,
        series: &mut BTreeMap<String, InstrumentSeries>,
        report: &mut CompletionReport,
        changed: &mut BTreeMap<String, Vec<NaiveDate>>,
    ) {
        let mut returned: HashMap<(&str, NaiveDate), &DailyRow> = HashMap::new();
        for vr in &outcome.rows {
            returned.entry((vr.instrument.as_str(), vr.date)).or_insert(&vr.row);
        }

        for instrument in instruments {
            let Some(range) = missing_by.get(instrument.as_str()) else {
                continue;
            };
            let s = series
                .entry(instrument.clone())
                .or_insert_with(|| InstrumentSeries::new(instrument.clone()));

            for date in &range.dates {
                if s.contains(date) {
                    continue;
                }
                let method = match returned.get(&(instrument.as_str(), *date)) {
                    Some(row) => {
                        let mut row = row.restricted_to(&self.fields);
                        row.source = RowSource::vendor(&outcome.source);
                        if s.insert_missing(*date, row) {
                            changed.entry(instrument.clone()).or_default().push(*date);
                            FillMethod::Vendor {
                                source: outcome.source.clone(),
                            }
                        } else {
                            FillMethod::NotReturned
                        }
                    }
                    None => FillMethod::NotReturned,
                };
                debug!(instrument = %instrument, date = %date, method = ?method, "Merged date");
                report.record(instrument, *date, method);
            }
        }
    }

    fn fallback_batch(
        &self,
        calendar: &TradingCalendar,
        instruments: &[String],
        missing_by: &HashMap<&str, &MissingRange>,
        series: &mut BTreeMap<String, InstrumentSeries>,
        report: &mut CompletionReport,
        changed: &mut BTreeMap<String, Vec<NaiveDate>>,
    ) {
        for instrument in instruments {
            let Some(range) = missing_by.get(instrument.as_str()) else {
                continue;
            };
            let s = series
                .entry(instrument.clone())
                .or_insert_with(|| InstrumentSeries::new(instrument.clone()));
            self.apply_fallback(calendar, s, &range.dates, report, changed);
        }
    }

    fn apply_fallback(
        &self,
        calendar: &TradingCalendar,
        series: &mut InstrumentSeries,
        dates: &[NaiveDate],
        report: &mut CompletionReport,
        changed: &mut BTreeMap<String, Vec<NaiveDate>>,
    ) {
        let instrument = series.instrument.clone();
        for date in dates {
            if series.contains(date) {
                continue;
            }
            let (row, method) = self.fallback_row(calendar, series, *date);
            if let Some(row) = row {
                if series.insert_missing(*date, row) {
                    changed.entry(instrument.clone()).or_default().push(*date);
                }
            }
            debug!(instrument = %instrument, date = %date, method = ?method, "Fallback applied");
            report.record(&instrument, *date, method);
        }
    }

    /// Substitute row for `date` per the fallback chain.
    fn fallback_row(
        &self,
        calendar: &TradingCalendar,
        series: &InstrumentSeries,
        date: NaiveDate,
    ) -> (Option<DailyRow>, FillMethod) {
        let Some(pos) = calendar.position(date) else {
            return (None, FillMethod::NoFallbackAvailable);
        };
        let within = |d: NaiveDate| {
            calendar
                .position(d)
                .map(|p| p.abs_diff(pos) <= self.lookback)
                .unwrap_or(false)
        };

        let prev = series.previous_vendor_row(date).filter(|(d, _)| within(*d));
        let next = series.next_vendor_row(date).filter(|(d, _)| within(*d));

        if let (Some((prev_date, prev_row)), Some((next_date, next_row))) = (prev, next) {
            if let (Some(p0), Some(p1)) = (calendar.position(prev_date), calendar.position(next_date)) {
                let t = (pos - p0) as f64 / (p1 - p0) as f64;
                let mut row = DailyRow::empty(RowSource::Interpolated);
                for field in &self.fields {
                    let value = match (prev_row.get(*field), next_row.get(*field)) {
                        (Some(a), Some(b)) => Some(a + (b - a) * t),
                        _ => None,
                    };
                    row.set(*field, value);
                }
                if !row.is_empty() {
                    return (Some(row), FillMethod::Interpolated);
                }
            }
        }

        if let Some((from, prev_row)) = prev {
            let mut row = prev_row.restricted_to(&self.fields);
            row.source = RowSource::ForwardFilled { from };
            if !row.is_empty() {
                return (Some(row), FillMethod::ForwardFilled { from });
            }
        }

        (None, FillMethod::NoFallbackAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::vendor::{DataSource, DataVendor, LocalCache, VendorError, VendorRow};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn calendar() -> TradingCalendar {
        TradingCalendar::weekdays(d("2024-01-01"), d("2024-01-31"), &[])
    }

    fn vendor_row(close: f64) -> DailyRow {
        DailyRow::empty(RowSource::vendor("stored")).with(Field::Close, close)
    }

    /// Vendor that answers `close = 100 + day-of-month` for every requested
    /// date, except for instruments listed in `down`.
    struct StubVendor {
        down: HashSet<String>,
        calls: AtomicU32,
    }

    impl StubVendor {
        fn new(down: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                down: down.iter().map(|s| s.to_string()).collect(),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DataVendor for StubVendor {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch(
            &self,
            instruments: &[String],
            start: NaiveDate,
            end: NaiveDate,
            _fields: &[Field],
        ) -> Result<Vec<VendorRow>, VendorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if instruments.iter().any(|i| self.down.contains(i)) {
                return Err(VendorError::unavailable("stub", "outage"));
            }
            let cal = calendar();
            let mut rows = Vec::new();
            for instrument in instruments {
                for date in cal.trading_dates(start, end) {
                    use chrono::Datelike;
                    rows.push(VendorRow {
                        instrument: instrument.clone(),
                        date,
                        row: DailyRow::empty(RowSource::vendor("ignored"))
                            .with(Field::Close, 100.0 + date.day() as f64)
                            .with(Field::Volume, 1000.0),
                    });
                }
            }
            Ok(rows)
        }
    }

    fn fetcher(vendor: Arc<StubVendor>, batch_size: usize) -> CompletionFetcher {
        let chain = SourceChain::new(
            vec![DataSource::PrimaryVendor(vendor)],
            Duration::from_secs(5),
        );
        CompletionFetcher::new(chain, Field::ALL.to_vec(), batch_size, 2, 60)
    }

    fn series_with(instrument: &str, rows: &[(&str, f64)]) -> InstrumentSeries {
        InstrumentSeries::from_rows(
            instrument,
            rows.iter().map(|(date, close)| (d(date), vendor_row(*close))),
        )
    }

    fn missing(instrument: &str, dates: &[&str]) -> MissingRange {
        MissingRange {
            instrument: instrument.into(),
            dates: dates.iter().map(|s| d(s)).collect(),
        }
    }

    #[test]
    fn test_plan_batches_groups_by_span_and_caps_size() {
        let ranges = vec![
            missing("A", &["2024-01-03"]),
            missing("B", &["2024-01-03"]),
            missing("C", &["2024-01-03"]),
            missing("D", &["2024-01-04", "2024-01-05"]),
            missing("E", &[]),
        ];
        let batches = CompletionFetcher::plan_batches(&ranges, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].instruments, vec!["A", "B"]);
        assert_eq!(batches[1].instruments, vec!["C"]);
        assert_eq!(batches[2].instruments, vec!["D"]);
        assert_eq!((batches[2].start, batches[2].end), (d("2024-01-04"), d("2024-01-05")));
    }

    #[tokio::test]
    async fn test_fills_only_missing_dates() {
        let vendor = StubVendor::new(&[]);
        let fetcher = fetcher(vendor.clone(), 50);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert(
            "X".to_string(),
            series_with("X", &[("2024-01-02", 1.0), ("2024-01-04", 3.0), ("2024-01-05", 4.0)]),
        );
        let before = input["X"].clone();

        let out = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-03"])])
            .await;

        let x = &out.series["X"];
        assert_eq!(x.len(), 4);
        assert_eq!(x.get(&d("2024-01-03")).unwrap().close, Some(103.0));
        assert_eq!(x.get(&d("2024-01-03")).unwrap().source, RowSource::vendor("stub"));
        for (date, row) in before.iter() {
            assert_eq!(x.get(date), Some(row));
        }
        assert_eq!(out.changed["X"], vec![d("2024-01-03")]);
        assert!(out.report.get("X").unwrap().is_clean());
        assert_eq!(vendor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let vendor = StubVendor::new(&[]);
        let fetcher = fetcher(vendor.clone(), 50);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert("X".to_string(), series_with("X", &[("2024-01-02", 1.0)]));
        let first = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-03"])])
            .await;
        let snapshot = first.series.clone();

        // Same missing set again: the date is now present and must not change
        let second = fetcher
            .complete(&cal, first.series, &[missing("X", &["2024-01-03"])])
            .await;
        assert_eq!(second.series, snapshot);
        assert!(second.changed.is_empty());
    }

    #[tokio::test]
    async fn test_outage_interpolates_between_vendor_rows() {
        let vendor = StubVendor::new(&["X"]);
        let fetcher = fetcher(vendor, 50);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert(
            "X".to_string(),
            series_with("X", &[("2024-01-02", 10.0), ("2024-01-05", 16.0)]),
        );
        let out = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-03", "2024-01-04"])])
            .await;

        let x = &out.series["X"];
        assert!((x.get(&d("2024-01-03")).unwrap().close.unwrap() - 12.0).abs() < 1e-9);
        assert!((x.get(&d("2024-01-04")).unwrap().close.unwrap() - 14.0).abs() < 1e-9);
        assert_eq!(x.get(&d("2024-01-03")).unwrap().source, RowSource::Interpolated);

        let report = out.report.get("X").unwrap();
        assert_eq!(report.fallback_count(), 2);
        assert_eq!(report.failed_sources, vec!["stub"]);
        assert!(report.unresolved().is_empty());
    }

    #[tokio::test]
    async fn test_outage_forward_fills_tail() {
        let vendor = StubVendor::new(&["X"]);
        let fetcher = fetcher(vendor, 50);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert("X".to_string(), series_with("X", &[("2024-01-03", 10.0)]));
        let out = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-04"])])
            .await;

        let row = out.series["X"].get(&d("2024-01-04")).unwrap();
        assert_eq!(row.close, Some(10.0));
        assert_eq!(row.source, RowSource::ForwardFilled { from: d("2024-01-03") });
        assert_eq!(
            out.report.get("X").unwrap().records[0].method,
            FillMethod::ForwardFilled { from: d("2024-01-03") }
        );
    }

    #[tokio::test]
    async fn test_outage_without_anchor_leaves_date_absent() {
        let vendor = StubVendor::new(&["Y"]);
        let fetcher = fetcher(vendor, 1);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert("Z".to_string(), series_with("Z", &[("2024-01-02", 5.0)]));
        let out = fetcher
            .complete(
                &cal,
                input,
                &[missing("Y", &["2024-01-10"]), missing("Z", &["2024-01-10"])],
            )
            .await;

        assert!(out.series.get("Y").map_or(true, |s| s.is_empty()));
        let y = out.report.get("Y").unwrap();
        assert_eq!(y.records[0].method, FillMethod::NoFallbackAvailable);
        assert_eq!(y.unresolved(), vec![d("2024-01-10")]);
        assert_eq!(y.quality_score, 0.0);

        // Z was in its own batch and still completed
        assert!(out.series["Z"].contains(&d("2024-01-10")));
        assert!(out.report.get("Z").unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_failover_without_rows_for_instrument_uses_fallback() {
        let vendor = StubVendor::new(&["A", "B"]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("A.json"),
            r#"[{"date": "2024-01-03", "close": 7.0}]"#,
        )
        .unwrap();
        let chain = SourceChain::new(
            vec![
                DataSource::PrimaryVendor(vendor),
                DataSource::LocalCache(LocalCache::new(dir.path())),
            ],
            Duration::from_secs(5),
        );
        let fetcher = CompletionFetcher::new(chain, Field::ALL.to_vec(), 50, 2, 60);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert(
            "B".to_string(),
            series_with("B", &[("2024-01-02", 10.0), ("2024-01-04", 14.0)]),
        );
        let out = fetcher
            .complete(
                &cal,
                input,
                &[missing("A", &["2024-01-03"]), missing("B", &["2024-01-03"])],
            )
            .await;

        let a = out.report.get("A").unwrap();
        assert_eq!(
            a.records[0].method,
            FillMethod::Vendor {
                source: LocalCache::NAME.into()
            }
        );
        assert_eq!(out.series["A"].get(&d("2024-01-03")).unwrap().close, Some(7.0));

        // The cache had no file for B, so B gets the fallback chain
        let b = out.report.get("B").unwrap();
        assert_eq!(b.records[0].method, FillMethod::Interpolated);
        assert_eq!(b.failed_sources, vec!["stub"]);
        let row = out.series["B"].get(&d("2024-01-03")).unwrap();
        assert!((row.close.unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(row.source, RowSource::Interpolated);
        assert_eq!(out.changed["B"], vec![d("2024-01-03")]);
    }

    #[tokio::test]
    async fn test_anchor_outside_lookback_is_ignored() {
        let vendor = StubVendor::new(&["X"]);
        let chain = SourceChain::new(
            vec![DataSource::PrimaryVendor(vendor)],
            Duration::from_secs(5),
        );
        let fetcher = CompletionFetcher::new(chain, vec![Field::Close], 50, 1, 2);
        let cal = calendar();

        let mut input = BTreeMap::new();
        input.insert("X".to_string(), series_with("X", &[("2024-01-02", 10.0)]));
        let out = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-05"])])
            .await;

        assert!(!out.series["X"].contains(&d("2024-01-05")));
        assert_eq!(
            out.report.get("X").unwrap().records[0].method,
            FillMethod::NoFallbackAvailable
        );
    }

    #[tokio::test]
    async fn test_synthetic_rows_are_not_anchors() {
        let vendor = StubVendor::new(&["X"]);
        let fetcher = fetcher(vendor, 50);
        let cal = calendar();

        let mut series = InstrumentSeries::new("X");
        series.insert_missing(
            d("2024-01-02"),
            DailyRow::empty(RowSource::Interpolated).with(Field::Close, 10.0),
        );
        let mut input = BTreeMap::new();
        input.insert("X".to_string(), series);

        let out = fetcher
            .complete(&cal, input, &[missing("X", &["2024-01-03"])])
            .await;
        assert!(!out.series["X"].contains(&d("2024-01-03")));
    }

    #[test]
    fn test_quality_score() {
        let full = series_with("X", &[("2024-01-02", 1.0), ("2024-01-03", 1.0)]);
        assert!((quality_score(&full, 0) - 1.0).abs() < 1e-12);

        // One of four dates unresolved, and a 7-day hole between present dates
        let holed = series_with(
            "X",
            &[("2024-01-02", 1.0), ("2024-01-03", 1.0), ("2024-01-10", 1.0)],
        );
        let expected = 0.7 * 0.75 + 0.3 * 0.5;
        assert!((quality_score(&holed, 1) - expected).abs() < 1e-12);

        assert_eq!(quality_score(&InstrumentSeries::new("X"), 0), 0.0);
    }
}
