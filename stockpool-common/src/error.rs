//! Error types for the stock pool engine.

use thiserror::Error;

/// Result type alias using the stock pool error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified run-level error type.
///
/// Component errors (vendor failures, indicator gaps, degraded scores) are
/// absorbed close to their source. Only the failures that end up here decide
/// the process exit code.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The trading calendar could not be read
    #[error("Calendar unavailable: {0}")]
    CalendarUnavailable(String),

    /// Storage layer failure that aborted the run
    #[error("Storage error: {0}")]
    Storage(String),

    /// The run completed but some instruments failed to persist
    #[error("Run finished with {failed} failed instrument(s)")]
    PartialFailure { failed: usize },

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// `2` marks a partial failure (some instruments committed), `1` an
    /// aborted run.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PartialFailure { .. } => 2,
            _ => 1,
        }
    }
}
