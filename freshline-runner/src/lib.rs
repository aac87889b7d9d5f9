//! Freshline Runner: collection orchestration on top of `freshline-core`.
//!
//! This crate provides:
//! - TOML configuration with per-source quota, throttle, mapping, sanitize,
//!   backfill and sentinel settings
//! - Source handles: configured HTTP upstreams or injected fetchers
//! - The generic collector (batch sources and date-point sources)
//! - Backfill wiring against the store and a daily request budget
//! - Sentinel freshness monitor (select, check, update-if-flagged)
//! - Run summaries and the append-only JSONL run log
//! - Parallel multi-source runs

pub mod backfill;
pub mod budget;
pub mod collector;
pub mod config;
pub mod freshness;
pub mod runner;
pub mod sources;
pub mod summary;

pub use backfill::{probe_latest, EntityScope, StoreGapSource};
pub use budget::RequestBudget;
pub use collector::{narrow, Collector, RunOptions};
pub use config::{ConfigError, FreshlineConfig, SourceConfig, SourceKind};
pub use freshness::{CheckReport, SelectionReport, SentinelMonitor, UpdateOutcome};
pub use runner::{Runner, SourceStatus};
pub use sources::{SourceHandle, Upstream};
pub use summary::{RunKind, RunLog, RunSummary};
