//! Stockpool Engine Library
//!
//! Maintains tiered pools of equities (basic -> watch -> core) from daily
//! market, fundamental and technical data that may have gaps.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌────────────┐   ┌─────────┐   ┌──────────┐
//! │ Calendar │──▶│   Gap    │──▶│ Completion │──▶│ Indicators │──▶│ Scoring │──▶│  Pools   │
//! │          │   │ Detector │   │  Fetcher   │   │   Engine   │   │ Engine  │   │ Manager  │
//! └──────────┘   └──────────┘   └────────────┘   └────────────┘   └─────────┘   └──────────┘
//!                                     │                                               │
//!                                     ▼                                               ▼
//!                              source chain                                  SQLite pool snapshot
//! ```
//!
//! # Key Concepts
//!
//! ## Completion
//! - Gaps are trading dates without a stored row
//! - Backfill only ever fills missing dates; settled rows are never replaced
//! - Vendor outages fall back to interpolation, then forward fill, then
//!   leave the date absent for the next run
//!
//! ## Incremental Indicators
//! - Every indicator reads a fixed trailing slice ending at its date
//! - Only dates whose slice contains a changed row are recomputed
//!
//! ## Tier Hysteresis
//! - Promotions need the next threshold and `min_dwell_days` in the tier
//! - Demotions need the score to fall `demotion_margin` below the threshold

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod data;
pub mod indicators;
pub mod pipeline;
pub mod pool;
pub mod scoring;

pub use data::{
    CompletionFetcher, CompletionReport, DailyRow, Field, GapDetector, InstrumentSeries,
    LocalStorage, MissingRange, RowSource, SourceChain, TradingCalendar,
};
pub use indicators::{IndicatorEngine, IndicatorSnapshot};
pub use pipeline::{FailedInstrument, PipelineError, PoolPipeline, RunSummary};
pub use pool::{Pool, PoolBook, PoolManager, PoolMember, PoolTransition, Tier};
pub use scoring::{ScoreRecord, ScoringEngine};
