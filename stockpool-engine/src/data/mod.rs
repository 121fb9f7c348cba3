//! Daily market data for the stock pool engine.
//!
//! Holds the per-instrument daily series and everything that keeps it
//! complete relative to the trading calendar.
//!
//! # Components
//! - **calendar**: authoritative trading dates
//! - **gap**: missing-date detection against the calendar
//! - **vendor**: the fetch capability and the ordered source chain
//! - **completion**: batched backfill with the interpolate / forward-fill fallback
//! - **local_storage**: SQLite persistence for series, indicators, scores and pools

pub mod calendar;
pub mod completion;
pub mod gap;
mod http_vendor;
pub mod local_storage;
pub mod vendor;

pub use calendar::{CalendarError, TradingCalendar};
pub use completion::{
    CompletionFetcher, CompletionOutcome, CompletionReport, FillMethod, FillRecord,
    InstrumentCompletion,
};
pub use gap::{GapDetector, MissingRange};
pub use http_vendor::HttpVendor;
pub use local_storage::{LocalStorage, LocalStorageConfig, SyncMetadata, SyncStatus};
pub use vendor::{
    ChainError, DataSource, DataVendor, FetchOutcome, LocalCache, SourceAttempt, SourceChain,
    VendorError, VendorRow,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Fields
// ============================================================================

/// A typed column of a daily row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
    Turnover,
    PeRatio,
    PbRatio,
    MarketCap,
    TurnoverRate,
}

impl Field {
    /// Every field, in storage column order.
    pub const ALL: [Field; 10] = [
        Field::Open,
        Field::High,
        Field::Low,
        Field::Close,
        Field::Volume,
        Field::Turnover,
        Field::PeRatio,
        Field::PbRatio,
        Field::MarketCap,
        Field::TurnoverRate,
    ];

    /// Column / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
            Self::Turnover => "turnover",
            Self::PeRatio => "pe_ratio",
            Self::PbRatio => "pb_ratio",
            Self::MarketCap => "market_cap",
            Self::TurnoverRate => "turnover_rate",
        }
    }

    /// Parse a column / wire name.
    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == s)
    }

    /// Parse a list of names; an empty list means every field.
    pub fn parse_set(names: &[String]) -> Result<Vec<Field>, String> {
        if names.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        let mut fields = names
            .iter()
            .map(|n| Self::from_name(n).ok_or_else(|| format!("unknown field '{}'", n)))
            .collect::<Result<Vec<_>, _>>()?;
        fields.sort();
        fields.dedup();
        Ok(fields)
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Provenance
// ============================================================================

/// Where a stored row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowSource {
    /// Returned by a data source in the chain
    Vendor { name: String },
    /// Linear interpolation between two vendor rows
    Interpolated,
    /// Copy of the vendor row at `from`
    ForwardFilled { from: NaiveDate },
}

impl RowSource {
    pub fn vendor(name: impl Into<String>) -> Self {
        Self::Vendor { name: name.into() }
    }

    /// Only vendor rows may anchor a fallback fill.
    pub fn is_vendor(&self) -> bool {
        matches!(self, Self::Vendor { .. })
    }

    /// Compact tag stored in the `source` column.
    pub fn to_tag(&self) -> String {
        match self {
            Self::Vendor { name } => format!("vendor:{}", name),
            Self::Interpolated => "interpolated".to_string(),
            Self::ForwardFilled { from } => format!("forward_filled:{}", from),
        }
    }

    /// Parse a `source` column tag. Unknown tags read as an unnamed vendor.
    pub fn from_tag(tag: &str) -> Self {
        if tag == "interpolated" {
            return Self::Interpolated;
        }
        if let Some(date) = tag.strip_prefix("forward_filled:") {
            if let Ok(from) = date.parse::<NaiveDate>() {
                return Self::ForwardFilled { from };
            }
        }
        let name = tag.strip_prefix("vendor:").unwrap_or(tag);
        Self::vendor(name)
    }
}

impl std::fmt::Display for RowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_tag())
    }
}

// ============================================================================
// Daily Row
// ============================================================================

/// One trading day of one instrument. Every field is independently nullable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRow {
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub pb_ratio: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub turnover_rate: Option<f64>,
    pub source: RowSource,
}

impl DailyRow {
    /// Row with every field null.
    pub fn empty(source: RowSource) -> Self {
        Self {
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            turnover: None,
            pe_ratio: None,
            pb_ratio: None,
            market_cap: None,
            turnover_rate: None,
            source,
        }
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Open => self.open,
            Field::High => self.high,
            Field::Low => self.low,
            Field::Close => self.close,
            Field::Volume => self.volume,
            Field::Turnover => self.turnover,
            Field::PeRatio => self.pe_ratio,
            Field::PbRatio => self.pb_ratio,
            Field::MarketCap => self.market_cap,
            Field::TurnoverRate => self.turnover_rate,
        }
    }

    pub fn set(&mut self, field: Field, value: Option<f64>) {
        let slot = match field {
            Field::Open => &mut self.open,
            Field::High => &mut self.high,
            Field::Low => &mut self.low,
            Field::Close => &mut self.close,
            Field::Volume => &mut self.volume,
            Field::Turnover => &mut self.turnover,
            Field::PeRatio => &mut self.pe_ratio,
            Field::PbRatio => &mut self.pb_ratio,
            Field::MarketCap => &mut self.market_cap,
            Field::TurnoverRate => &mut self.turnover_rate,
        };
        // NaN is treated as unknown
        *slot = value.filter(|v| v.is_finite());
    }

    /// Builder-style setter.
    pub fn with(mut self, field: Field, value: f64) -> Self {
        self.set(field, Some(value));
        self
    }

    /// True when every field is null.
    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }

    /// Copy of this row keeping only `fields`.
    pub fn restricted_to(&self, fields: &[Field]) -> Self {
        let mut row = Self::empty(self.source.clone());
        for field in fields {
            row.set(*field, self.get(*field));
        }
        row
    }
}

// ============================================================================
// Instrument Series
// ============================================================================

/// Daily rows of one instrument keyed by trading date.
///
/// Rows with every field null are never stored; `insert_missing` refuses
/// them and never replaces an existing key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentSeries {
    pub instrument: String,
    rows: BTreeMap<NaiveDate, DailyRow>,
}

impl InstrumentSeries {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            rows: BTreeMap::new(),
        }
    }

    /// Build a series from stored rows, dropping all-null rows.
    pub fn from_rows(
        instrument: impl Into<String>,
        rows: impl IntoIterator<Item = (NaiveDate, DailyRow)>,
    ) -> Self {
        let mut series = Self::new(instrument);
        for (date, row) in rows {
            series.insert_missing(date, row);
        }
        series
    }

    /// Insert a row at a date that is not yet present.
    ///
    /// Returns `false` (and leaves the series untouched) when the date is
    /// already present or the row is entirely null.
    pub fn insert_missing(&mut self, date: NaiveDate, row: DailyRow) -> bool {
        if row.is_empty() || self.rows.contains_key(&date) {
            return false;
        }
        self.rows.insert(date, row);
        true
    }

    pub fn get(&self, date: &NaiveDate) -> Option<&DailyRow> {
        self.rows.get(date)
    }

    pub fn contains(&self, date: &NaiveDate) -> bool {
        self.rows.contains_key(date)
    }

    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.rows.keys().copied().collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.rows.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaiveDate, &DailyRow)> {
        self.rows.iter()
    }

    /// Rows within `[start, end]`.
    pub fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Iterator<Item = (&NaiveDate, &DailyRow)> {
        let (lo, hi) = if start <= end { (start, end) } else { (end, end) };
        self.rows
            .range(lo..=hi)
            .filter(move |(d, _)| start <= end && **d >= start)
    }

    /// Nearest row strictly before `date` whose provenance is a vendor.
    pub fn previous_vendor_row(&self, date: NaiveDate) -> Option<(NaiveDate, &DailyRow)> {
        self.rows
            .range(..date)
            .rev()
            .find(|(_, r)| r.source.is_vendor())
            .map(|(d, r)| (*d, r))
    }

    /// Nearest row strictly after `date` whose provenance is a vendor.
    pub fn next_vendor_row(&self, date: NaiveDate) -> Option<(NaiveDate, &DailyRow)> {
        self.rows
            .range((std::ops::Bound::Excluded(date), std::ops::Bound::Unbounded))
            .find(|(_, r)| r.source.is_vendor())
            .map(|(d, r)| (*d, r))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
