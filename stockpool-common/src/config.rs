//! Configuration management for the stock pool engine.
//!
//! The engine reads a single configuration file at `~/.stockpool/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (STOCKPOOL_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `STOCKPOOL_DB_PATH` → storage.db_path
//! - `STOCKPOOL_VENDOR_URL` → vendor.base_url
//! - `STOCKPOOL_VENDOR_TOKEN` → vendor.api_token
//! - `STOCKPOOL_LOG_LEVEL` → observability.log_level
//! - `STOCKPOOL_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".stockpool"),
        |dirs| dirs.home_dir().join(".stockpool"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for one engine deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Local database configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Trading calendar source
    #[serde(default)]
    pub calendar: CalendarConfig,

    /// Market data vendor configuration
    #[serde(default)]
    pub vendor: VendorConfig,

    /// Gap detection and completion settings
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Indicator catalogue
    #[serde(default)]
    pub indicators: IndicatorConfig,

    /// Scoring rules and pool policy
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Instrument universe processed by `run` when none are given explicitly
    #[serde(default)]
    pub instruments: Vec<String>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STOCKPOOL_DB_PATH") {
            if !path.is_empty() {
                self.storage.db_path = PathBuf::from(path);
            }
        }
        if let Ok(url) = std::env::var("STOCKPOOL_VENDOR_URL") {
            if !url.is_empty() {
                self.vendor.base_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("STOCKPOOL_VENDOR_TOKEN") {
            if !token.is_empty() {
                self.vendor.api_token = Some(token);
            }
        }
        if let Ok(level) = std::env::var("STOCKPOOL_LOG_LEVEL") {
            if !level.is_empty() {
                self.observability.log_level = level;
            }
        }
        if let Ok(format) = std::env::var("STOCKPOOL_LOG_FORMAT") {
            if !format.is_empty() {
                self.observability.log_format = format;
            }
        }
    }
}

// ============================================================================
// Observability & Storage
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// ============================================================================
// Calendar
// ============================================================================

/// Trading calendar source.
///
/// When `path` is set the calendar is read from that file (JSON array of ISO
/// dates, or one date per line). Otherwise a weekday calendar starting at
/// `since` is generated with `holidays` removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_calendar_since")]
    pub since: NaiveDate,

    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            path: None,
            since: default_calendar_since(),
            holidays: Vec::new(),
        }
    }
}

// ============================================================================
// Vendor
// ============================================================================

/// Kind of data source in the fetch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Remote HTTP market data vendor
    PrimaryVendor,
    /// Local snapshot directory (`<cache_dir>/<instrument>.json`)
    LocalCache,
}

/// Market data vendor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Base URL of the HTTP vendor
    #[serde(default)]
    pub base_url: Option<String>,

    /// API token sent as a bearer token
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-call timeout in seconds
    #[serde(default = "default_vendor_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory holding local snapshot files
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Sources in priority order; the first success wins
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceKind>,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_secs: default_vendor_timeout_secs(),
            cache_dir: None,
            sources: default_sources(),
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Gap detection and completion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Cold-start window length in calendar days
    #[serde(default = "default_max_fill_days")]
    pub max_fill_days: i64,

    /// Maximum instruments per vendor call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent vendor calls
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Field names requested from the vendor; empty means every field
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_fill_days: default_max_fill_days(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            fields: Vec::new(),
        }
    }
}

// ============================================================================
// Indicators
// ============================================================================

/// One configured indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorDef {
    Sma { field: String, window: usize },
    Ema { field: String, window: usize },
    Rsi { window: usize },
    Volatility { window: usize },
    VolumeRatio { window: usize },
    Momentum { window: usize },
}

impl IndicatorDef {
    /// Trailing window length of this indicator.
    pub fn window(&self) -> usize {
        match self {
            Self::Sma { window, .. }
            | Self::Ema { window, .. }
            | Self::Rsi { window }
            | Self::Volatility { window }
            | Self::VolumeRatio { window }
            | Self::Momentum { window } => *window,
        }
    }
}

/// Indicator catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Minimum lookback in trading days; the effective lookback is the
    /// larger of this and the longest indicator window
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,

    #[serde(default = "default_indicators")]
    pub specs: Vec<IndicatorDef>,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            specs: default_indicators(),
        }
    }
}

// ============================================================================
// Scoring & Pools
// ============================================================================

/// Shape of a rule's sub-score curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCurve {
    /// Full score inside the ideal range, linear decay outside
    #[default]
    Linear,
    /// Full score inside the ideal range, `good_score` inside the good range
    Tiered,
}

/// One weighted scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringRuleConfig {
    pub name: String,

    /// Field name (`close`, `pe_ratio`, ...) or indicator name (`rsi_14`, ...)
    pub input: String,

    pub ideal_range: (f64, f64),

    pub ideal_score: f64,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub good_range: Option<(f64, f64)>,

    #[serde(default)]
    pub good_score: Option<f64>,

    #[serde(default)]
    pub curve: ScoreCurve,
}

/// Promotion thresholds per tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_basic_threshold")]
    pub basic: f64,
    #[serde(default = "default_watch_threshold")]
    pub watch: f64,
    #[serde(default = "default_core_threshold")]
    pub core: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            basic: default_basic_threshold(),
            watch: default_watch_threshold(),
            core: default_core_threshold(),
        }
    }
}

/// Maximum members per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_basic_capacity")]
    pub basic: usize,
    #[serde(default = "default_watch_capacity")]
    pub watch: usize,
    #[serde(default = "default_core_capacity")]
    pub core: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            basic: default_basic_capacity(),
            watch: default_watch_capacity(),
            core: default_core_capacity(),
        }
    }
}

/// Scoring rule set and pool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<ScoringRuleConfig>,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    /// Trading days a member must stay in a tier before the next promotion
    #[serde(default = "default_min_dwell_days")]
    pub min_dwell_days: u32,

    /// How far below a tier's threshold a score may fall before demotion
    #[serde(default = "default_demotion_margin")]
    pub demotion_margin: f64,

    /// Share of total weight that may have missing inputs before a score
    /// counts as degraded
    #[serde(default = "default_missing_tolerance")]
    pub missing_tolerance: f64,

    #[serde(default)]
    pub capacity: CapacityConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            thresholds: ThresholdsConfig::default(),
            min_dwell_days: default_min_dwell_days(),
            demotion_margin: default_demotion_margin(),
            missing_tolerance: default_missing_tolerance(),
            capacity: CapacityConfig::default(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_db_path() -> PathBuf {
    config_dir().join("stockpool.db")
}
fn default_calendar_since() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default()
}
fn default_vendor_timeout_secs() -> u64 {
    30
}
fn default_sources() -> Vec<SourceKind> {
    vec![SourceKind::PrimaryVendor, SourceKind::LocalCache]
}
fn default_max_fill_days() -> i64 {
    30
}
fn default_batch_size() -> usize {
    50
}
fn default_max_workers() -> usize {
    4
}
fn default_lookback_days() -> usize {
    60
}
fn default_indicators() -> Vec<IndicatorDef> {
    vec![
        IndicatorDef::Sma { field: "close".into(), window: 5 },
        IndicatorDef::Sma { field: "close".into(), window: 20 },
        IndicatorDef::Ema { field: "close".into(), window: 12 },
        IndicatorDef::Rsi { window: 14 },
        IndicatorDef::Volatility { window: 20 },
        IndicatorDef::VolumeRatio { window: 5 },
        IndicatorDef::Momentum { window: 20 },
    ]
}
fn default_weight() -> f64 {
    1.0
}
fn default_basic_threshold() -> f64 {
    3.0
}
fn default_watch_threshold() -> f64 {
    6.0
}
fn default_core_threshold() -> f64 {
    9.0
}
fn default_basic_capacity() -> usize {
    500
}
fn default_watch_capacity() -> usize {
    50
}
fn default_core_capacity() -> usize {
    5
}
fn default_min_dwell_days() -> u32 {
    5
}
fn default_demotion_margin() -> f64 {
    0.5
}
fn default_missing_tolerance() -> f64 {
    0.5
}

fn tiered_rule(
    name: &str,
    input: &str,
    ideal: (f64, f64),
    ideal_score: f64,
    good: (f64, f64),
    good_score: f64,
) -> ScoringRuleConfig {
    ScoringRuleConfig {
        name: name.into(),
        input: input.into(),
        ideal_range: ideal,
        ideal_score,
        weight: default_weight(),
        good_range: Some(good),
        good_score: Some(good_score),
        curve: ScoreCurve::Tiered,
    }
}

fn default_rules() -> Vec<ScoringRuleConfig> {
    vec![
        tiered_rule("pe", "pe_ratio", (8.0, 25.0), 15.0, (5.0, 40.0), 8.0),
        tiered_rule("pb", "pb_ratio", (0.5, 3.0), 12.0, (0.3, 5.0), 6.0),
        tiered_rule("rsi", "rsi_14", (40.0, 60.0), 10.0, (30.0, 70.0), 5.0),
        tiered_rule("turnover", "turnover_rate", (1.0, 8.0), 8.0, (0.5, 15.0), 4.0),
    ]
}
