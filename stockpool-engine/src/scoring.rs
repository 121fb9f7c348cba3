//! Composite scoring.
//!
//! Maps an instrument's latest row and indicator snapshot to a scalar score
//! through a weighted rule set. Pure and deterministic: the same inputs and
//! rule set always produce the same `ScoreRecord`, fingerprinted by
//! `inputs_hash`.
//!
//! A rule whose input is missing scores 0 but keeps its weight in the
//! denominator, so absent data is penalised rather than ignored.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use stockpool_common::config::{ScoreCurve, ScoringConfig, ScoringRuleConfig};
use thiserror::Error;

use crate::data::{DailyRow, Field};
use crate::indicators::IndicatorSnapshot;

/// Marker hashed in place of a missing input value.
const NULL_MARKER: &[u8] = b"\0null";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    #[error("Invalid rule set: {0}")]
    InvalidRuleSet(String),
}

// ============================================================================
// Rule
// ============================================================================

/// Where a rule reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleInput {
    Field(Field),
    Indicator(String),
}

impl RuleInput {
    /// Field names resolve to a row column, anything else to an indicator.
    pub fn resolve(name: &str) -> Self {
        match Field::from_name(name) {
            Some(field) => Self::Field(field),
            None => Self::Indicator(name.to_string()),
        }
    }

    fn value(&self, row: Option<&DailyRow>, snapshot: Option<&IndicatorSnapshot>) -> Option<f64> {
        match self {
            Self::Field(field) => row.and_then(|r| r.get(*field)),
            Self::Indicator(name) => snapshot.and_then(|s| s.get(name)),
        }
        .filter(|v| v.is_finite())
    }

    fn name(&self) -> &str {
        match self {
            Self::Field(field) => field.as_str(),
            Self::Indicator(name) => name,
        }
    }
}

/// A validated scoring rule.
#[derive(Debug, Clone)]
pub struct ScoringRule {
    pub config: ScoringRuleConfig,
    pub input: RuleInput,
}

impl ScoringRule {
    pub fn new(config: ScoringRuleConfig) -> Result<Self, ScoringError> {
        let invalid = |msg: &str| ScoringError::InvalidRuleSet(format!("rule '{}': {}", config.name, msg));

        let (lo, hi) = config.ideal_range;
        if !(lo.is_finite() && hi.is_finite()) || lo > hi {
            return Err(invalid("ideal_range must be finite and ordered"));
        }
        if !config.ideal_score.is_finite() || config.ideal_score < 0.0 {
            return Err(invalid("ideal_score must be non-negative"));
        }
        if !config.weight.is_finite() || config.weight < 0.0 {
            return Err(invalid("weight must be non-negative"));
        }
        if let Some((glo, ghi)) = config.good_range {
            if glo > lo || ghi < hi {
                return Err(invalid("good_range must contain ideal_range"));
            }
        }
        if config.curve == ScoreCurve::Tiered {
            match (config.good_range, config.good_score) {
                (Some(_), Some(g)) if (0.0..=config.ideal_score).contains(&g) => {}
                _ => return Err(invalid("tiered curve needs good_range and good_score within [0, ideal_score]")),
            }
        }

        let input = RuleInput::resolve(&config.input);
        Ok(Self { config, input })
    }

    /// Sub-score in `[0, ideal_score]`.
    pub fn sub_score(&self, value: f64) -> f64 {
        let c = &self.config;
        let (lo, hi) = c.ideal_range;
        if (lo..=hi).contains(&value) {
            return c.ideal_score;
        }

        let score = match c.curve {
            ScoreCurve::Tiered => match (c.good_range, c.good_score) {
                (Some((glo, ghi)), Some(good)) if (glo..=ghi).contains(&value) => good,
                _ => 0.0,
            },
            ScoreCurve::Linear => {
                let width = hi - lo;
                let (outer_lo, outer_hi) = c.good_range.unwrap_or((lo - width, hi + width));
                let (edge, outer) = if value < lo { (lo, outer_lo) } else { (hi, outer_hi) };
                let span = (edge - outer).abs();
                if span == 0.0 {
                    0.0
                } else {
                    c.ideal_score * (1.0 - (value - edge).abs() / span)
                }
            }
        };
        score.clamp(0.0, c.ideal_score)
    }
}

// ============================================================================
// Score Record
// ============================================================================

/// Score of one instrument as of one date. Superseded by the next run,
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub instrument: String,
    pub as_of: NaiveDate,
    pub composite_score: f64,
    /// Rule name -> sub-score
    pub component_scores: BTreeMap<String, f64>,
    /// Hex SHA-256 of the rule set, input values and as-of date
    pub inputs_hash: String,
    /// Rules whose input was missing
    pub missing_inputs: Vec<String>,
    /// Missing-input weight exceeded the tolerance
    pub degraded: bool,
}

/// Inputs for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub instrument: &'a str,
    pub latest_row: Option<&'a DailyRow>,
    pub snapshot: Option<&'a IndicatorSnapshot>,
}

// ============================================================================
// Scoring Engine
// ============================================================================

pub struct ScoringEngine {
    rules: Vec<ScoringRule>,
    missing_tolerance: f64,
}

impl ScoringEngine {
    pub fn new(rules: Vec<ScoringRuleConfig>, missing_tolerance: f64) -> Result<Self, ScoringError> {
        if !(0.0..=1.0).contains(&missing_tolerance) {
            return Err(ScoringError::InvalidRuleSet(
                "missing_tolerance must be within [0, 1]".into(),
            ));
        }

        let mut names = HashSet::new();
        for rule in &rules {
            if rule.name.is_empty() {
                return Err(ScoringError::InvalidRuleSet("rule name is empty".into()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ScoringError::InvalidRuleSet(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        let rules = rules
            .into_iter()
            .map(ScoringRule::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            missing_tolerance,
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self, ScoringError> {
        Self::new(config.rules.clone(), config.missing_tolerance)
    }

    pub fn rules(&self) -> &[ScoringRule] {
        &self.rules
    }

    /// Indicator names the rule set reads.
    pub fn indicator_inputs(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter_map(|r| match &r.input {
                RuleInput::Indicator(name) => Some(name.as_str()),
                RuleInput::Field(_) => None,
            })
            .collect()
    }

    pub fn score(
        &self,
        instrument: &str,
        as_of: NaiveDate,
        latest_row: Option<&DailyRow>,
        snapshot: Option<&IndicatorSnapshot>,
    ) -> ScoreRecord {
        let mut component_scores = BTreeMap::new();
        let mut missing_inputs = Vec::new();
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut missing_weight = 0.0;

        let mut hasher = Sha256::new();
        self.hash_rule_set(&mut hasher);

        for rule in &self.rules {
            let weight = rule.config.weight;
            let value = rule.input.value(latest_row, snapshot);

            hasher.update(rule.input.name().as_bytes());
            let sub = match value {
                Some(v) => {
                    hasher.update(v.to_bits().to_le_bytes());
                    rule.sub_score(v)
                }
                None => {
                    hasher.update(NULL_MARKER);
                    missing_inputs.push(rule.config.name.clone());
                    missing_weight += weight;
                    0.0
                }
            };

            component_scores.insert(rule.config.name.clone(), sub);
            weighted_sum += sub * weight;
            total_weight += weight;
        }
        hasher.update(as_of.to_string().as_bytes());

        let composite_score = if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        };

        ScoreRecord {
            instrument: instrument.to_string(),
            as_of,
            composite_score,
            component_scores,
            inputs_hash: hex::encode(hasher.finalize()),
            missing_inputs,
            degraded: missing_weight > self.missing_tolerance * total_weight,
        }
    }

    /// Score many instruments in parallel, in input order.
    pub fn score_all(&self, as_of: NaiveDate, inputs: &[ScoreInput<'_>]) -> Vec<ScoreRecord> {
        inputs
            .par_iter()
            .map(|i| self.score(i.instrument, as_of, i.latest_row, i.snapshot))
            .collect()
    }

    fn hash_rule_set(&self, hasher: &mut Sha256) {
        for rule in &self.rules {
            let c = &rule.config;
            hasher.update(c.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(c.input.as_bytes());
            hasher.update([0u8]);
            for v in [c.ideal_range.0, c.ideal_range.1, c.ideal_score, c.weight] {
                hasher.update(v.to_bits().to_le_bytes());
            }
            match c.good_range {
                Some((lo, hi)) => {
                    hasher.update(lo.to_bits().to_le_bytes());
                    hasher.update(hi.to_bits().to_le_bytes());
                }
                None => hasher.update(NULL_MARKER),
            }
            match c.good_score {
                Some(g) => hasher.update(g.to_bits().to_le_bytes()),
                None => hasher.update(NULL_MARKER),
            }
            hasher.update(match c.curve {
                ScoreCurve::Linear => b"linear".as_slice(),
                ScoreCurve::Tiered => b"tiered".as_slice(),
            });
        }
    }
}
