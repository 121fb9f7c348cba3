//! Stockpool Common - Shared configuration, errors and logging for the stock pool engine.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Run-level error types and exit codes
//! - Logging setup and run identifiers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    CalendarConfig, CapacityConfig, CompletionConfig, Config, IndicatorConfig, IndicatorDef,
    ObservabilityConfig, ScoreCurve, ScoringConfig, ScoringRuleConfig, SourceKind,
    StorageConfig, ThresholdsConfig, VendorConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

