//! Stockpool - Tiered stock pool refresh.
//!
//! Exit codes: 0 when every instrument was persisted, 2 when some
//! instruments failed to persist, 1 when the run was aborted.

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use stockpool_common::config::Config;
use stockpool_common::logging::init_logging;
use stockpool_common::{Error, Result};
use stockpool_engine::pool::Tier;
use stockpool_engine::PoolPipeline;

#[derive(Parser, Debug)]
#[command(name = "stockpool")]
#[command(version)]
#[command(about = "Keep tiered stock pools complete and scored.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.stockpool/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect gaps, backfill, recompute indicators, rescore and repartition
    Run {
        /// Run date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Instruments to refresh, comma separated (default: config, then storage)
        #[arg(long, value_delimiter = ',')]
        instruments: Vec<String>,
    },

    /// Show storage statistics and pool sizes
    Status,

    /// Show recent pool transitions and score history
    Report {
        /// Only this instrument
        #[arg(long)]
        instrument: Option<String>,

        /// Maximum entries per section
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Run failed");
            eprintln!("error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    // Start timing immediately for cold-start measurement
    let startup_start = std::time::Instant::now();
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_deref())
        .map_err(|e| Error::Config(format!("{:#}", e)))?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Stockpool v{}", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .map_err(|e| Error::Config(e.to_string()))?;

    let pipeline = PoolPipeline::from_config(&config)?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Pipeline initialized in {:?}",
        startup_duration
    );

    match cli.command {
        Commands::Run { as_of, instruments } => {
            let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
            let instruments = resolve_instruments(&pipeline, &config, instruments).await?;

            let summary = pipeline.run(&instruments, as_of).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.is_partial() {
                return Err(Error::PartialFailure {
                    failed: summary.failed.len(),
                });
            }
            Ok(())
        }
        Commands::Status => {
            let storage = pipeline.storage();
            let stats = storage.get_stats().await.map_err(storage_error)?;
            let book = storage.read_pool_book().await.map_err(storage_error)?;

            let pools: serde_json::Map<String, serde_json::Value> = Tier::POOLS
                .iter()
                .map(|t| {
                    let members: Vec<_> = book
                        .pool(*t)
                        .map(|p| p.members().collect())
                        .unwrap_or_default();
                    (
                        t.to_string(),
                        json!({ "size": members.len(), "members": members }),
                    )
                })
                .collect();

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "db_path": storage.db_path(),
                    "rows": stats.row_count,
                    "instruments": stats.instrument_count,
                    "indicator_values": stats.indicator_count,
                    "scores": stats.score_count,
                    "transitions": stats.transition_count,
                    "db_size_bytes": stats.db_size_bytes,
                    "pools": pools,
                }))?
            );
            tracing::info!("{}", stats);
            Ok(())
        }
        Commands::Report { instrument, limit } => {
            let storage = pipeline.storage();
            let transitions = storage
                .recent_transitions(instrument.as_deref(), limit)
                .await
                .map_err(storage_error)?;

            let scores = match &instrument {
                Some(i) => storage.score_history(i, limit).await.map_err(storage_error)?,
                None => Vec::new(),
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "transitions": transitions,
                    "scores": scores,
                }))?
            );
            Ok(())
        }
    }
}

/// Command line list, else the configured list, else everything stored.
async fn resolve_instruments(
    pipeline: &PoolPipeline,
    config: &Config,
    from_cli: Vec<String>,
) -> Result<Vec<String>> {
    let cleaned: Vec<String> = from_cli
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if !cleaned.is_empty() {
        return Ok(cleaned);
    }
    if !config.instruments.is_empty() {
        return Ok(config.instruments.clone());
    }

    let stored = pipeline
        .storage()
        .list_instruments()
        .await
        .map_err(storage_error)?;
    if stored.is_empty() {
        return Err(Error::InvalidInput(
            "no instruments given, configured or stored".into(),
        ));
    }
    Ok(stored)
}

fn storage_error(e: anyhow::Error) -> Error {
    Error::Storage(format!("{:#}", e))
}
