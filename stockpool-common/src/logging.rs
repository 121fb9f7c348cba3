//! Tracing setup for pipeline runs.
//!
//! Output is one JSON object per event (`json`) or human-readable lines
//! (`pretty`). Every run opens a `pipeline_run` span carrying its run id,
//! so all events of one refresh can be grouped.
//!
//! HTTP, TLS and SQLite internals log at `warn` and above only, whatever the
//! configured level. `RUST_LOG` replaces the whole filter when set.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Dependency targets capped at `warn`.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "rusqlite",
];

fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(log_level))
}

fn filter_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }
    directives
}

/// Install the global subscriber for `log_level` and `log_format`
/// (`json` or `pretty`). Only the first call in a process takes effect.
pub fn init_logging(log_level: &str, log_format: &str) {
    let registry = tracing_subscriber::registry().with(build_filter(log_level));

    let installed = match log_format {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .is_ok(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_file(false).with_line_number(false))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(log_level, log_format, "Logging initialized");
    }
}

/// Fresh run id for the `pipeline_run` span.
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `pipeline_run` span tagged with a run id, plus any extra fields.
///
/// ```ignore
/// let span = run_span!(run_id, as_of = %date);
/// ```
#[macro_export]
macro_rules! run_span {
    ($run_id:expr) => {
        tracing::info_span!("pipeline_run", run_id = %$run_id)
    };
    ($run_id:expr, $($field:tt)*) => {
        tracing::info_span!("pipeline_run", run_id = %$run_id, $($field)*)
    };
}
