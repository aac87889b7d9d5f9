//! Freshline Core: incremental collection and freshness engine.
//!
//! This crate decides, per tracked entity, whether new data must be fetched,
//! from which point and in which mode, without letting one entity's failure
//! touch another:
//! - Domain types (sync points, tracking records, observations, freshness)
//! - Sanitizer and record mapper
//! - SQLite store: tracking, observations, freshness, sentinels, quota
//!   ledger, unit leases, sync history
//! - Unit-of-Work executor with per-unit transactions
//! - Rate-limited request planner
//! - Gap detector with two-phase backfill
//! - Sentinel sampling and change detection
//! - Fetcher traits, HTTP fetchers and reference catalogs

pub mod data;
pub mod domain;
pub mod error;
pub mod executor;
pub mod gap;
pub mod mapper;
pub mod planner;
pub mod sanitize;
pub mod sentinel;
pub mod store;

pub use domain::{
    Category, EntityId, FreshnessState, FreshnessStatus, NaiveDateRange, Observation, PointKind,
    RawRecord, SentinelReading, SentinelRole, SentinelSample, SentinelValue, SourceId, SyncMode,
    SyncPoint, TrackingKey, TrackingRecord,
};
pub use error::{DataShapeError, FatalError, FetchError, StoreError};
pub use executor::{
    FailureKind, FullSyncReceipt, UnitExecutor, UnitOfWorkResult, UnitRequest, UnitStatus,
    UnitTally,
};
pub use sanitize::{sanitize, FieldPolicies, SanitizationPolicy};
pub use store::{RecordOutcome, SyncStore};
