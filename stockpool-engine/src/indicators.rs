//! Technical indicators over daily series.
//!
//! Every indicator is a pure function of a fixed-size trailing slice of
//! trading dates ending at the evaluation date. Nothing after that date is
//! ever read, so a snapshot for date D only changes when a row at or before
//! D changes.
//!
//! # Supported Indicators
//! - **SMA** / **EMA** over any field
//! - **RSI** on close (simple mean gain / loss)
//! - **Volatility**: annualised sample std-dev of close-to-close returns
//! - **Volume ratio**: volume over the mean volume of the preceding days
//! - **Momentum**: close over the close `n` days earlier, minus one
//!
//! A missing row or a null input anywhere in the slice yields a null value,
//! never a zero.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stockpool_common::config::{IndicatorConfig, IndicatorDef};
use thiserror::Error;
use tracing::debug;

use crate::data::{Field, InstrumentSeries, TradingCalendar};

/// Trading days per year used to annualise volatility.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// ============================================================================
// Errors
// ============================================================================

/// Why an indicator value is null.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndicatorError {
    #[error("Insufficient history: need {needed} trading days, have {available}")]
    InsufficientHistory { needed: usize, available: usize },

    #[error("Missing {field} on {date}")]
    MissingInput { date: NaiveDate, field: Field },

    #[error("Undefined value: {0}")]
    Undefined(String),

    #[error("Unknown field '{0}' in indicator definition")]
    UnknownField(String),
}

// ============================================================================
// Indicator Spec
// ============================================================================

/// One configured indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorSpec {
    Sma { field: Field, window: usize },
    Ema { field: Field, window: usize },
    Rsi { window: usize },
    Volatility { window: usize },
    VolumeRatio { window: usize },
    Momentum { window: usize },
}

impl IndicatorSpec {
    pub fn from_def(def: &IndicatorDef) -> Result<Self, IndicatorError> {
        let field = |name: &str| {
            Field::from_name(name).ok_or_else(|| IndicatorError::UnknownField(name.to_string()))
        };
        Ok(match def {
            IndicatorDef::Sma { field: f, window } => Self::Sma {
                field: field(f)?,
                window: *window,
            },
            IndicatorDef::Ema { field: f, window } => Self::Ema {
                field: field(f)?,
                window: *window,
            },
            IndicatorDef::Rsi { window } => Self::Rsi { window: *window },
            IndicatorDef::Volatility { window } => Self::Volatility { window: *window },
            IndicatorDef::VolumeRatio { window } => Self::VolumeRatio { window: *window },
            IndicatorDef::Momentum { window } => Self::Momentum { window: *window },
        })
    }

    /// Canonical name used as the snapshot key and as a scoring input.
    pub fn name(&self) -> String {
        match self {
            Self::Sma { field, window } => format!("sma_{}_{}", field, window),
            Self::Ema { field, window } => format!("ema_{}_{}", field, window),
            Self::Rsi { window } => format!("rsi_{}", window),
            Self::Volatility { window } => format!("volatility_{}", window),
            Self::VolumeRatio { window } => format!("volume_ratio_{}", window),
            Self::Momentum { window } => format!("momentum_{}", window),
        }
    }

    fn field(&self) -> Field {
        match self {
            Self::Sma { field, .. } | Self::Ema { field, .. } => *field,
            Self::VolumeRatio { .. } => Field::Volume,
            Self::Rsi { .. } | Self::Volatility { .. } | Self::Momentum { .. } => Field::Close,
        }
    }

    /// Length of the trailing slice, the evaluation date included.
    pub fn required_periods(&self) -> usize {
        match self {
            Self::Sma { window, .. } => (*window).max(1),
            // First half seeds the average, second half is smoothed
            Self::Ema { window, .. } => (*window).max(1) * 2,
            Self::Rsi { window }
            | Self::Volatility { window }
            | Self::VolumeRatio { window }
            | Self::Momentum { window } => (*window).max(1) + 1,
        }
    }

    /// Value over an oldest-to-newest slice of exactly `required_periods`.
    pub fn calculate(&self, values: &[f64]) -> Result<f64, IndicatorError> {
        let needed = self.required_periods();
        if values.len() < needed {
            return Err(IndicatorError::InsufficientHistory {
                needed,
                available: values.len(),
            });
        }
        let values = &values[values.len() - needed..];

        match self {
            Self::Sma { window, .. } => Ok(mean(values, *window)),
            Self::Ema { window, .. } => {
                let n = (*window).max(1);
                let multiplier = 2.0 / (n as f64 + 1.0);
                let seed = mean(&values[..n], n);
                Ok(values[n..]
                    .iter()
                    .fold(seed, |prev, v| (v - prev) * multiplier + prev))
            }
            Self::Rsi { window } => {
                let n = (*window).max(1);
                let (gain, loss) = values.windows(2).fold((0.0, 0.0), |(g, l), w| {
                    let change = w[1] - w[0];
                    if change > 0.0 {
                        (g + change, l)
                    } else {
                        (g, l - change)
                    }
                });
                let (avg_gain, avg_loss) = (gain / n as f64, loss / n as f64);
                if avg_loss == 0.0 {
                    // Flat slice reads as neutral
                    return Ok(if avg_gain == 0.0 { 50.0 } else { 100.0 });
                }
                let rs = avg_gain / avg_loss;
                Ok(100.0 - 100.0 / (1.0 + rs))
            }
            Self::Volatility { .. } => {
                let mut returns = Vec::with_capacity(values.len() - 1);
                for w in values.windows(2) {
                    if w[0] == 0.0 {
                        return Err(IndicatorError::Undefined("zero close in return".into()));
                    }
                    returns.push(w[1] / w[0] - 1.0);
                }
                if returns.len() < 2 {
                    return Err(IndicatorError::Undefined("need two returns".into()));
                }
                let m = mean(&returns, returns.len());
                let var = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>()
                    / (returns.len() - 1) as f64;
                Ok(var.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
            }
            Self::VolumeRatio { window } => {
                let (history, today) = values.split_at(values.len() - 1);
                let avg = mean(history, *window);
                if avg == 0.0 {
                    return Err(IndicatorError::Undefined("zero average volume".into()));
                }
                Ok(today[0] / avg)
            }
            Self::Momentum { .. } => {
                let base = values[0];
                if base == 0.0 {
                    return Err(IndicatorError::Undefined("zero base close".into()));
                }
                Ok(values[values.len() - 1] / base - 1.0)
            }
        }
    }
}

fn mean(values: &[f64], n: usize) -> f64 {
    values.iter().sum::<f64>() / n.max(1) as f64
}

// ============================================================================
// Snapshot
// ============================================================================

/// Indicator values of one instrument on one date. `None` marks a value
/// that could not be computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub instrument: String,
    pub date: NaiveDate,
    pub values: BTreeMap<String, Option<f64>>,
}

impl IndicatorSnapshot {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().flatten()
    }

    /// Names whose value is null.
    pub fn null_names(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Incremental indicator recomputation.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    specs: Vec<IndicatorSpec>,
    /// Trading days any snapshot may depend on, the evaluation date included
    lookback: usize,
}

impl IndicatorEngine {
    /// The lookback is the larger of `min_lookback` and the longest slice.
    pub fn new(specs: Vec<IndicatorSpec>, min_lookback: usize) -> Self {
        let longest = specs.iter().map(|s| s.required_periods()).max().unwrap_or(1);
        Self {
            specs,
            lookback: longest.max(min_lookback).max(1),
        }
    }

    pub fn from_config(config: &IndicatorConfig) -> Result<Self, IndicatorError> {
        let specs = config
            .specs
            .iter()
            .map(IndicatorSpec::from_def)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(specs, config.lookback_days))
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name()).collect()
    }

    /// Earliest date whose row is needed to recompute from `earliest_changed`.
    pub fn required_read_start(
        &self,
        calendar: &TradingCalendar,
        earliest_changed: NaiveDate,
    ) -> Option<NaiveDate> {
        calendar.shift_back(earliest_changed, self.lookback - 1)
    }

    /// Snapshot for `date` from rows at or before `date` only.
    pub fn snapshot_at(
        &self,
        calendar: &TradingCalendar,
        series: &InstrumentSeries,
        date: NaiveDate,
    ) -> IndicatorSnapshot {
        let mut values = BTreeMap::new();
        for spec in &self.specs {
            let value = match Self::evaluate(spec, calendar, series, date) {
                Ok(v) if v.is_finite() => Some(v),
                Ok(_) => None,
                Err(e) => {
                    debug!(
                        instrument = %series.instrument,
                        date = %date,
                        indicator = %spec.name(),
                        reason = %e,
                        "Indicator is null"
                    );
                    None
                }
            };
            values.insert(spec.name(), value);
        }
        IndicatorSnapshot {
            instrument: series.instrument.clone(),
            date,
            values,
        }
    }

    fn evaluate(
        spec: &IndicatorSpec,
        calendar: &TradingCalendar,
        series: &InstrumentSeries,
        date: NaiveDate,
    ) -> Result<f64, IndicatorError> {
        let needed = spec.required_periods();
        let slice = calendar.trailing(date, needed);
        if slice.len() < needed {
            return Err(IndicatorError::InsufficientHistory {
                needed,
                available: slice.len(),
            });
        }

        let field = spec.field();
        let values = slice
            .iter()
            .map(|d| {
                series
                    .get(d)
                    .and_then(|row| row.get(field))
                    .ok_or(IndicatorError::MissingInput { date: *d, field })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        spec.calculate(&values)
    }

    /// Snapshots for every present date whose trailing slice contains one
    /// of `changed_dates`, ascending.
    pub fn recompute(
        &self,
        calendar: &TradingCalendar,
        series: &InstrumentSeries,
        changed_dates: &[NaiveDate],
    ) -> Vec<IndicatorSnapshot> {
        let mut changed: Vec<usize> = changed_dates
            .iter()
            .filter_map(|d| calendar.position(*d))
            .collect();
        changed.sort_unstable();
        changed.dedup();
        let Some(&earliest) = changed.first() else {
            return Vec::new();
        };

        let affected = |pos: usize| {
            // Latest changed position at or before `pos`
            let idx = changed.partition_point(|c| *c <= pos);
            idx > 0 && pos - changed[idx - 1] < self.lookback
        };

        let snapshots: Vec<IndicatorSnapshot> = series
            .iter()
            .filter_map(|(date, _)| calendar.position(*date).map(|p| (*date, p)))
            .filter(|(_, p)| *p >= earliest && affected(*p))
            .map(|(date, _)| self.snapshot_at(calendar, series, date))
            .collect();

        debug!(
            instrument = %series.instrument,
            changed = changed.len(),
            snapshots = snapshots.len(),
            "Recomputed indicators"
        );
        snapshots
    }

    /// Recompute many instruments in parallel.
    pub fn recompute_all(
        &self,
        calendar: &TradingCalendar,
        work: &[(&InstrumentSeries, Vec<NaiveDate>)],
    ) -> BTreeMap<String, Vec<IndicatorSnapshot>> {
        work.par_iter()
            .map(|(series, changed)| {
                (
                    series.instrument.clone(),
                    self.recompute(calendar, series, changed),
                )
            })
            .collect()
    }
}
