//! Configuration validation for the stock pool engine.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use thiserror::Error;

use crate::config::{
    CompletionConfig, Config, IndicatorConfig, IndicatorDef, ObservabilityConfig, ScoreCurve,
    ScoringConfig, SourceKind, VendorConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.vendor.validate() {
            errors.push(e);
        }
        if let Err(e) = self.completion.validate() {
            errors.push(e);
        }
        if let Err(e) = self.indicators.validate() {
            errors.push(e);
        }
        if let Err(e) = self.scoring.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

impl Validate for VendorConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.sources.is_empty() {
            return Err(ValidationError::MissingField {
                field: "vendor.sources".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "vendor.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.sources.contains(&SourceKind::LocalCache) && self.cache_dir.is_none() {
            // Only an error when the cache is the sole source
            if self.sources.len() == 1 {
                return Err(ValidationError::MissingField {
                    field: "vendor.cache_dir".into(),
                });
            }
        }
        Ok(())
    }
}

/// Longest cold-start lookback, in calendar days (about a century).
pub const MAX_FILL_DAYS: i64 = 36_500;

impl Validate for CompletionConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_fill_days < 0 {
            return Err(ValidationError::InvalidValue {
                field: "completion.max_fill_days".into(),
                reason: "must not be negative".into(),
            });
        }
        if self.max_fill_days > MAX_FILL_DAYS {
            return Err(ValidationError::InvalidValue {
                field: "completion.max_fill_days".into(),
                reason: format!("must be at most {}", MAX_FILL_DAYS),
            });
        }
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "completion.batch_size".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_workers == 0 {
            return Err(ValidationError::InvalidValue {
                field: "completion.max_workers".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for IndicatorConfig {
    fn validate(&self) -> ValidationResult<()> {
        for (i, spec) in self.specs.iter().enumerate() {
            // Sample std-dev needs at least two returns
            let min_window = match spec {
                IndicatorDef::Volatility { .. } => 2,
                _ => 1,
            };
            if spec.window() < min_window {
                return Err(ValidationError::InvalidValue {
                    field: format!("indicators.specs[{}].window", i),
                    reason: format!("must be at least {}", min_window),
                });
            }
        }
        Ok(())
    }
}

impl Validate for ScoringConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (i, rule) in self.rules.iter().enumerate() {
            let field = |name: &str| format!("scoring.rules[{}].{}", i, name);

            if rule.name.trim().is_empty() {
                errors.push(ValidationError::MissingField { field: field("name") });
            }
            if !(rule.weight >= 0.0) {
                errors.push(ValidationError::InvalidValue {
                    field: field("weight"),
                    reason: "must be a non-negative number".into(),
                });
            }
            if !(rule.ideal_score >= 0.0) {
                errors.push(ValidationError::InvalidValue {
                    field: field("ideal_score"),
                    reason: "must be a non-negative number".into(),
                });
            }
            if !(rule.ideal_range.0 <= rule.ideal_range.1) {
                errors.push(ValidationError::InvalidValue {
                    field: field("ideal_range"),
                    reason: "lower bound must not exceed upper bound".into(),
                });
            }
            if let Some((lo, hi)) = rule.good_range {
                if !(lo <= rule.ideal_range.0 && rule.ideal_range.1 <= hi) {
                    errors.push(ValidationError::InvalidValue {
                        field: field("good_range"),
                        reason: "must contain ideal_range".into(),
                    });
                }
            }
            if rule.curve == ScoreCurve::Tiered {
                match rule.good_score {
                    Some(s) if s >= 0.0 && s <= rule.ideal_score => {}
                    Some(_) => errors.push(ValidationError::InvalidValue {
                        field: field("good_score"),
                        reason: "must lie in [0, ideal_score]".into(),
                    }),
                    None => errors.push(ValidationError::MissingField {
                        field: field("good_score"),
                    }),
                }
            }
        }

        let t = &self.thresholds;
        if !(t.basic <= t.watch && t.watch <= t.core) {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "thresholds must be non-decreasing (basic {} / watch {} / core {})",
                    t.basic, t.watch, t.core
                ),
            });
        }
        if !(self.demotion_margin >= 0.0) {
            errors.push(ValidationError::InvalidValue {
                field: "scoring.demotion_margin".into(),
                reason: "must be a non-negative number".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.missing_tolerance) {
            errors.push(ValidationError::InvalidValue {
                field: "scoring.missing_tolerance".into(),
                reason: "must lie in [0, 1]".into(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}
