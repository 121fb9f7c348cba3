//! Data source chain.
//!
//! The engine never talks to a vendor SDK directly. Every source implements
//! the same fetch contract and the chain walks them in configured priority
//! order, stopping at the first success and recording a typed failure for
//! every attempt before it.
//!
//! Sources are a closed set:
//! - **PrimaryVendor**: anything implementing [`DataVendor`] (HTTP adapter in
//!   production, fakes in tests)
//! - **LocalCache**: per-instrument JSON snapshot files on disk

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::{DailyRow, Field, RowSource};

// ============================================================================
// Errors
// ============================================================================

/// Failure of a single fetch attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VendorError {
    /// The source could not provide the data (outage, HTTP error, bad payload)
    #[error("Data unavailable from {vendor}: {reason}")]
    DataUnavailable { vendor: String, reason: String },

    /// The call exceeded its deadline
    #[error("Call to {vendor} timed out after {secs}s")]
    Timeout { vendor: String, secs: u64 },
}

impl VendorError {
    pub fn unavailable(vendor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            vendor: vendor.into(),
            reason: reason.into(),
        }
    }
}

/// One failed attempt in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    pub source: String,
    pub error: VendorError,
}

/// Every source in the chain failed. Treated as `DataUnavailable` by the
/// completion stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("All {} data source(s) failed", .attempts.len())]
pub struct ChainError {
    pub attempts: Vec<SourceAttempt>,
}

// ============================================================================
// Fetch Contract
// ============================================================================

/// A row returned by a source. Its `row.source` is overwritten with the
/// answering source when merged.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRow {
    pub instrument: String,
    pub date: NaiveDate,
    pub row: DailyRow,
}

/// Market data vendor capability.
#[async_trait]
pub trait DataVendor: Send + Sync {
    /// Vendor name recorded as row provenance
    fn name(&self) -> &str;

    /// Daily rows for `instruments` in `[start, end]` restricted to `fields`.
    ///
    /// A vendor may omit rows it has no data for; it fails only when the
    /// whole request could not be served.
    async fn fetch(
        &self,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError>;
}

// ============================================================================
// Local Cache
// ============================================================================

/// Snapshot entry in `<dir>/<instrument>.json`.
#[derive(Debug, Deserialize)]
struct CachedRow {
    date: NaiveDate,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    turnover: Option<f64>,
    #[serde(default)]
    pe_ratio: Option<f64>,
    #[serde(default)]
    pb_ratio: Option<f64>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    turnover_rate: Option<f64>,
}

impl CachedRow {
    fn into_row(self, name: &str) -> DailyRow {
        let mut row = DailyRow::empty(RowSource::vendor(name));
        row.set(Field::Open, self.open);
        row.set(Field::High, self.high);
        row.set(Field::Low, self.low);
        row.set(Field::Close, self.close);
        row.set(Field::Volume, self.volume);
        row.set(Field::Turnover, self.turnover);
        row.set(Field::PeRatio, self.pe_ratio);
        row.set(Field::PbRatio, self.pb_ratio);
        row.set(Field::MarketCap, self.market_cap);
        row.set(Field::TurnoverRate, self.turnover_rate);
        row
    }
}

/// Directory of per-instrument JSON snapshots exported by an earlier bulk
/// download.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub const NAME: &'static str = "local_cache";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, instrument: &str) -> PathBuf {
        self.dir.join(format!("{}.json", instrument))
    }

    /// Read snapshot rows. Instruments without a snapshot file are skipped;
    /// the call fails only when none of them has one.
    pub async fn fetch(
        &self,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError> {
        let mut rows = Vec::new();
        let mut found = 0usize;

        for instrument in instruments {
            let path = self.snapshot_path(instrument);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(VendorError::unavailable(
                        Self::NAME,
                        format!("failed to read {}: {}", path.display(), e),
                    ))
                }
            };
            let cached: Vec<CachedRow> = serde_json::from_str(&content).map_err(|e| {
                VendorError::unavailable(
                    Self::NAME,
                    format!("failed to parse {}: {}", path.display(), e),
                )
            })?;
            found += 1;

            rows.extend(
                cached
                    .into_iter()
                    .filter(|c| c.date >= start && c.date <= end)
                    .map(|c| VendorRow {
                        instrument: instrument.clone(),
                        date: c.date,
                        row: c.into_row(Self::NAME).restricted_to(fields),
                    }),
            );
        }

        if found == 0 {
            return Err(VendorError::unavailable(
                Self::NAME,
                format!("no snapshot for {} instrument(s)", instruments.len()),
            ));
        }

        debug!(instruments = instruments.len(), found, rows = rows.len(), "Read local cache");
        Ok(rows)
    }
}

// ============================================================================
// Source Chain
// ============================================================================

/// A data source in the chain.
#[derive(Clone)]
pub enum DataSource {
    PrimaryVendor(Arc<dyn DataVendor>),
    LocalCache(LocalCache),
}

impl DataSource {
    pub fn name(&self) -> &str {
        match self {
            Self::PrimaryVendor(vendor) => vendor.name(),
            Self::LocalCache(_) => LocalCache::NAME,
        }
    }

    pub async fn fetch(
        &self,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError> {
        match self {
            Self::PrimaryVendor(vendor) => vendor.fetch(instruments, start, end, fields).await,
            Self::LocalCache(cache) => cache.fetch(instruments, start, end, fields).await,
        }
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryVendor(vendor) => write!(f, "PrimaryVendor({})", vendor.name()),
            Self::LocalCache(cache) => write!(f, "LocalCache({})", cache.dir.display()),
        }
    }
}

/// Successful fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Name of the source that answered
    pub source: String,
    pub rows: Vec<VendorRow>,
    /// Sources tried and failed before the answering one
    pub failed_attempts: Vec<SourceAttempt>,
}

/// Ordered list of sources with a per-call deadline.
#[derive(Debug, Clone)]
pub struct SourceChain {
    sources: Vec<DataSource>,
    timeout: Duration,
}

impl SourceChain {
    pub fn new(sources: Vec<DataSource>, timeout: Duration) -> Self {
        Self { sources, timeout }
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    /// Try each source in order until one answers.
    pub async fn fetch(
        &self,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[Field],
    ) -> Result<FetchOutcome, ChainError> {
        let mut attempts = Vec::new();

        for source in &self.sources {
            let name = source.name().to_string();
            debug!(
                source = %name,
                instruments = instruments.len(),
                start = %start,
                end = %end,
                "Routing fetch to source"
            );

            let result =
                tokio::time::timeout(self.timeout, source.fetch(instruments, start, end, fields))
                    .await
                    .unwrap_or_else(|_| {
                        Err(VendorError::Timeout {
                            vendor: name.clone(),
                            secs: self.timeout.as_secs(),
                        })
                    });

            match result {
                Ok(rows) => {
                    return Ok(FetchOutcome {
                        source: name,
                        rows,
                        failed_attempts: attempts,
                    })
                }
                Err(error) => {
                    warn!(source = %name, error = %error, "Source failed, trying next");
                    attempts.push(SourceAttempt {
                        source: name,
                        error,
                    });
                }
            }
        }

        Err(ChainError { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    struct FixedVendor {
        name: &'static str,
        fail: bool,
        delay: Option<Duration>,
        calls: AtomicU32,
    }

    impl FixedVendor {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                fail,
                delay: None,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DataVendor for FixedVendor {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(
            &self,
            instruments: &[String],
            start: NaiveDate,
            _end: NaiveDate,
            _fields: &[Field],
        ) -> Result<Vec<VendorRow>, VendorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(VendorError::unavailable(self.name, "outage"));
            }
            Ok(instruments
                .iter()
                .map(|i| VendorRow {
                    instrument: i.clone(),
                    date: start,
                    row: DailyRow::empty(RowSource::vendor(self.name)).with(Field::Close, 1.0),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let primary = Arc::new(FixedVendor::new("primary", false));
        let backup = Arc::new(FixedVendor::new("backup", false));
        let chain = SourceChain::new(
            vec![
                DataSource::PrimaryVendor(primary.clone()),
                DataSource::PrimaryVendor(backup.clone()),
            ],
            Duration::from_secs(5),
        );

        let out = chain
            .fetch(&["X".into()], d("2024-01-02"), d("2024-01-02"), &Field::ALL)
            .await
            .unwrap();
        assert_eq!(out.source, "primary");
        assert!(out.failed_attempts.is_empty());
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failover_records_attempts() {
        let primary = Arc::new(FixedVendor::new("primary", true));
        let backup = Arc::new(FixedVendor::new("backup", false));
        let chain = SourceChain::new(
            vec![
                DataSource::PrimaryVendor(primary),
                DataSource::PrimaryVendor(backup),
            ],
            Duration::from_secs(5),
        );

        let out = chain
            .fetch(&["X".into()], d("2024-01-02"), d("2024-01-02"), &Field::ALL)
            .await
            .unwrap();
        assert_eq!(out.source, "backup");
        assert_eq!(out.failed_attempts.len(), 1);
        assert_eq!(out.failed_attempts[0].source, "primary");
    }

    #[tokio::test]
    async fn test_timeout_is_typed_failure() {
        let slow = Arc::new(FixedVendor {
            delay: Some(Duration::from_millis(200)),
            ..FixedVendor::new("slow", false)
        });
        let chain = SourceChain::new(
            vec![DataSource::PrimaryVendor(slow)],
            Duration::from_millis(20),
        );

        let err = chain
            .fetch(&["X".into()], d("2024-01-02"), d("2024-01-02"), &Field::ALL)
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 1);
        assert!(matches!(err.attempts[0].error, VendorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_local_cache_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("600519.SH.json"),
            r#"[{"date":"2024-01-02","close":1700.0,"pe_ratio":30.1},
                {"date":"2024-01-03","close":1710.0}]"#,
        )
        .unwrap();
        let cache = LocalCache::new(dir.path());

        let rows = cache
            .fetch(
                &["600519.SH".into(), "000001.SZ".into()],
                d("2024-01-03"),
                d("2024-01-03"),
                &[Field::Close],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.close, Some(1710.0));
        assert_eq!(rows[0].row.source, RowSource::vendor("local_cache"));
    }

    #[tokio::test]
    async fn test_local_cache_without_snapshots_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let result = cache
            .fetch(&["X".into()], d("2024-01-02"), d("2024-01-02"), &Field::ALL)
            .await;
        assert!(matches!(result, Err(VendorError::DataUnavailable { .. })));
    }
}
