//! End-to-end pool runs against a SQLite store in a temp directory.
//!
//! Vendors are in-process fakes that count their calls, so the tests can
//! check both what was persisted and how often the chain was consulted.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stockpool_common::config::{
    Config, IndicatorDef, ScoreCurve, ScoringRuleConfig, ThresholdsConfig,
};
use stockpool_engine::data::{
    DailyRow, DataSource, DataVendor, Field, FillMethod, FillRecord, LocalCache, LocalStorage,
    LocalStorageConfig, RowSource, SourceChain, SyncStatus, VendorError, VendorRow,
};
use stockpool_engine::pool::Tier;
use stockpool_engine::PoolPipeline;
use tempfile::{tempdir, TempDir};

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

// ============================================================================
// Mock Vendors for Testing
// ============================================================================

/// Serves a fixed table of closes. Requests that include an instrument in
/// `unavailable` fail as a whole.
struct StubVendor {
    closes: HashMap<(String, NaiveDate), f64>,
    unavailable: HashSet<String>,
    calls: AtomicU32,
}

impl StubVendor {
    fn new() -> Self {
        Self {
            closes: HashMap::new(),
            unavailable: HashSet::new(),
            calls: AtomicU32::new(0),
        }
    }

    fn with_close(mut self, instrument: &str, date: &str, close: f64) -> Self {
        self.closes.insert((instrument.to_string(), d(date)), close);
        self
    }

    fn unavailable_for(mut self, instrument: &str) -> Self {
        self.unavailable.insert(instrument.to_string());
        self
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
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
        _start: NaiveDate,
        _end: NaiveDate,
        _fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(down) = instruments.iter().find(|i| self.unavailable.contains(i.as_str())) {
            return Err(VendorError::unavailable("stub", format!("no data for {}", down)));
        }

        // Deliberately ignores the requested range
        Ok(self
            .closes
            .iter()
            .filter(|((i, _), _)| instruments.contains(i))
            .map(|((i, date), close)| VendorRow {
                instrument: i.clone(),
                date: *date,
                row: DailyRow::empty(RowSource::vendor("stub")).with(Field::Close, *close),
            })
            .collect())
    }
}

/// Always fails, as an exhausted or unreachable primary would.
struct DownVendor {
    calls: AtomicU32,
}

#[async_trait]
impl DataVendor for DownVendor {
    fn name(&self) -> &str {
        "down"
    }

    async fn fetch(
        &self,
        _instruments: &[String],
        _start: NaiveDate,
        _end: NaiveDate,
        _fields: &[Field],
    ) -> Result<Vec<VendorRow>, VendorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VendorError::unavailable("down", "quota exhausted"))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Four trading days, 2024-01-02 through 2024-01-05, from a calendar file.
/// One `close` rule with ideal range [10, 20] worth 10 points; Basic at 5.
fn config(dir: &TempDir) -> Config {
    let calendar_path = dir.path().join("calendar.txt");
    std::fs::write(
        &calendar_path,
        "# test exchange\n2024-01-02\n2024-01-03\n2024-01-04\n2024-01-05\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.storage.db_path = dir.path().join("stockpool.db");
    config.calendar.path = Some(calendar_path);
    config.completion.batch_size = 1;
    config.indicators.lookback_days = 2;
    config.indicators.specs = vec![IndicatorDef::Sma {
        field: "close".into(),
        window: 2,
    }];
    config.scoring.rules = vec![ScoringRuleConfig {
        name: "close".into(),
        input: "close".into(),
        ideal_range: (10.0, 20.0),
        ideal_score: 10.0,
        weight: 1.0,
        good_range: None,
        good_score: None,
        curve: ScoreCurve::Linear,
    }];
    config.scoring.thresholds = ThresholdsConfig {
        basic: 5.0,
        watch: 20.0,
        core: 30.0,
    };
    config
}

fn open_storage(config: &Config) -> Arc<LocalStorage> {
    Arc::new(LocalStorage::new(LocalStorageConfig::from(&config.storage)).unwrap())
}

fn chain_of(sources: Vec<DataSource>) -> SourceChain {
    SourceChain::new(sources, Duration::from_secs(5))
}

/// X stored for 01-02, 01-04 and 01-05; 01-03 is an interior hole.
async fn seed_x(storage: &LocalStorage) {
    let row = |close: f64| DailyRow::empty(RowSource::vendor("seed")).with(Field::Close, close);
    storage
        .write_series(
            "X",
            &[
                (d("2024-01-02"), row(12.0)),
                (d("2024-01-04"), row(14.0)),
                (d("2024-01-05"), row(15.0)),
            ],
        )
        .await
        .unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_interior_gap_is_filled_scored_and_pooled() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    let vendor = Arc::new(StubVendor::new().with_close("X", "2024-01-03", 13.0));
    let chain = chain_of(vec![DataSource::PrimaryVendor(vendor.clone())]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();

    let summary = pipeline
        .run(&["X".to_string()], d("2024-01-05"))
        .await
        .unwrap();

    assert_eq!(vendor.call_count(), 1);
    assert_eq!(summary.trading_date, d("2024-01-05"));
    assert_eq!(summary.fully_updated, vec!["X".to_string()]);
    assert!(summary.failed.is_empty());
    assert_eq!(
        summary.completion_report.get("X").unwrap().records,
        vec![FillRecord {
            date: d("2024-01-03"),
            method: FillMethod::Vendor {
                source: "stub".into()
            },
        }]
    );

    // Series is complete and the filled row carries its provenance
    let series = storage
        .read_series("X", d("2024-01-02"), d("2024-01-05"))
        .await
        .unwrap();
    assert_eq!(series.len(), 4);
    let filled = series.get(&d("2024-01-03")).unwrap();
    assert_eq!(filled.get(Field::Close), Some(13.0));
    assert_eq!(filled.source, RowSource::vendor("stub"));

    // Indicators over the changed window
    let at_gap = storage
        .read_indicators("X", d("2024-01-03"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_gap.get("sma_close_2"), Some(12.5));
    let next = storage
        .read_indicators("X", d("2024-01-04"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.get("sma_close_2"), Some(13.5));
    let latest = storage
        .read_indicators("X", d("2024-01-05"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.get("sma_close_2"), Some(14.5));

    // close 15 sits inside [10, 20]
    let scores = storage.score_history("X", 10).await.unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].as_of, d("2024-01-05"));
    assert_eq!(scores[0].composite_score, 10.0);
    assert!(!scores[0].degraded);

    let book = storage.read_pool_book().await.unwrap();
    assert_eq!(book.tier_of("X"), Tier::Basic);
    assert_eq!(summary.transitions.len(), 1);
    assert_eq!(summary.transitions[0].from, Tier::Unranked);
    assert_eq!(summary.transitions[0].to, Tier::Basic);

    let logged = storage.recent_transitions(Some("X"), 10).await.unwrap();
    assert_eq!(logged.len(), 1);

    let sync = storage.get_sync_metadata("X").await.unwrap().unwrap();
    assert_eq!(sync.sync_status, SyncStatus::Synced);
    assert_eq!(sync.last_date, Some(d("2024-01-05")));
}

#[tokio::test]
async fn test_vendor_outage_without_anchors_leaves_dates_absent() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    let vendor = Arc::new(
        StubVendor::new()
            .with_close("X", "2024-01-03", 13.0)
            .unavailable_for("Y"),
    );
    let chain = chain_of(vec![DataSource::PrimaryVendor(vendor.clone())]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();

    let summary = pipeline
        .run(&["X".to_string(), "Y".to_string()], d("2024-01-05"))
        .await
        .unwrap();

    // The run completes for X
    assert!(!summary.is_partial());
    assert_eq!(summary.fully_updated, vec!["X".to_string()]);
    assert_eq!(summary.degraded, vec!["Y".to_string()]);

    // Y is a cold start with nothing to anchor a fallback on
    let y = summary.completion_report.get("Y").unwrap();
    assert_eq!(y.records.len(), 4);
    assert!(y
        .records
        .iter()
        .all(|r| r.method == FillMethod::NoFallbackAvailable));
    assert_eq!(y.failed_sources, vec!["stub".to_string()]);
    assert_eq!(y.quality_score, 0.0);

    let y_series = storage
        .read_series("Y", d("2024-01-01"), d("2024-01-31"))
        .await
        .unwrap();
    assert!(y_series.is_empty());

    let y_scores = storage.score_history("Y", 10).await.unwrap();
    assert_eq!(y_scores.len(), 1);
    assert!(y_scores[0].degraded);

    let book = storage.read_pool_book().await.unwrap();
    assert_eq!(book.tier_of("X"), Tier::Basic);
    assert_eq!(book.tier_of("Y"), Tier::Unranked);

    let sync = storage.get_sync_metadata("Y").await.unwrap().unwrap();
    assert_eq!(sync.sync_status, SyncStatus::Failed);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    let vendor = Arc::new(StubVendor::new().with_close("X", "2024-01-03", 13.0));
    let chain = chain_of(vec![DataSource::PrimaryVendor(vendor.clone())]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();
    let instruments = vec!["X".to_string()];

    pipeline.run(&instruments, d("2024-01-05")).await.unwrap();
    let calls = vendor.call_count();
    let before = storage.get_stats().await.unwrap();

    let summary = pipeline.run(&instruments, d("2024-01-05")).await.unwrap();
    let after = storage.get_stats().await.unwrap();

    assert_eq!(vendor.call_count(), calls);
    assert!(summary.transitions.is_empty());
    assert_eq!(summary.completion_report.total_records(), 0);
    assert_eq!(summary.fully_updated, instruments);
    assert_eq!(after.row_count, before.row_count);
    assert_eq!(after.indicator_count, before.indicator_count);
    assert_eq!(after.score_count, before.score_count);
    assert_eq!(after.transition_count, before.transition_count);

    let book = storage.read_pool_book().await.unwrap();
    assert_eq!(book.tier_of("X"), Tier::Basic);
}

#[tokio::test]
async fn test_stored_rows_are_never_overwritten() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    // The vendor also answers for dates that are already stored
    let vendor = Arc::new(
        StubVendor::new()
            .with_close("X", "2024-01-02", 99.0)
            .with_close("X", "2024-01-03", 13.0)
            .with_close("X", "2024-01-05", 99.0),
    );
    let chain = chain_of(vec![DataSource::PrimaryVendor(vendor)]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();

    pipeline
        .run(&["X".to_string()], d("2024-01-05"))
        .await
        .unwrap();

    let series = storage
        .read_series("X", d("2024-01-02"), d("2024-01-05"))
        .await
        .unwrap();
    let close = |date: &str| series.get(&d(date)).and_then(|r| r.get(Field::Close));
    assert_eq!(close("2024-01-02"), Some(12.0));
    assert_eq!(close("2024-01-03"), Some(13.0));
    assert_eq!(close("2024-01-05"), Some(15.0));
    assert_eq!(
        series.get(&d("2024-01-02")).unwrap().source,
        RowSource::vendor("seed")
    );
}

#[tokio::test]
async fn test_local_cache_answers_when_primary_is_down() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    std::fs::write(
        cache_dir.join("X.json"),
        r#"[{"date": "2024-01-03", "close": 13.5, "volume": 1000}]"#,
    )
    .unwrap();

    let primary = Arc::new(DownVendor {
        calls: AtomicU32::new(0),
    });
    let chain = chain_of(vec![
        DataSource::PrimaryVendor(primary.clone()),
        DataSource::LocalCache(LocalCache::new(&cache_dir)),
    ]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();

    let summary = pipeline
        .run(&["X".to_string()], d("2024-01-05"))
        .await
        .unwrap();

    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    let x = summary.completion_report.get("X").unwrap();
    assert_eq!(x.failed_sources, vec!["down".to_string()]);
    assert_eq!(
        x.records[0].method,
        FillMethod::Vendor {
            source: LocalCache::NAME.into()
        }
    );

    let series = storage
        .read_series("X", d("2024-01-03"), d("2024-01-03"))
        .await
        .unwrap();
    let row = series.get(&d("2024-01-03")).unwrap();
    assert_eq!(row.get(Field::Close), Some(13.5));
    assert_eq!(row.source, RowSource::vendor(LocalCache::NAME));
}

#[tokio::test]
async fn test_fallback_interpolates_between_vendor_rows() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let storage = open_storage(&config);
    seed_x(&storage).await;

    let vendor = Arc::new(StubVendor::new().unavailable_for("X"));
    let chain = chain_of(vec![DataSource::PrimaryVendor(vendor)]);
    let pipeline = PoolPipeline::new(storage.clone(), chain, &config).unwrap();

    let summary = pipeline
        .run(&["X".to_string()], d("2024-01-05"))
        .await
        .unwrap();

    assert_eq!(summary.degraded, vec!["X".to_string()]);
    assert_eq!(
        summary.completion_report.get("X").unwrap().records[0].method,
        FillMethod::Interpolated
    );

    let series = storage
        .read_series("X", d("2024-01-03"), d("2024-01-03"))
        .await
        .unwrap();
    let row = series.get(&d("2024-01-03")).unwrap();
    assert_eq!(row.get(Field::Close), Some(13.0));
    assert_eq!(row.source, RowSource::Interpolated);
}
