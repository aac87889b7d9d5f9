//! Error taxonomy.
//!
//! Only [`FatalError`] escapes a run. Fetch, shape and persistence failures are
//! caught at the unit-of-work boundary and reported in the run summary; values
//! outside storage bounds are clamped by the sanitizer and never raised.

use crate::domain::PointKind;
use thiserror::Error;

/// Errors a fetcher can return.
///
/// Designed to be displayable in CLI output and run logs.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    Transient(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("hard stop: provider has blocked requests (circuit breaker open)")]
    CircuitOpen,

    #[error("response format changed: {0}")]
    DataShape(String),

    #[error("fatal provider error: {0}")]
    Fatal(String),

    #[error("operation not supported by {0}")]
    Unsupported(String),
}

impl FetchError {
    /// Fatal errors (credentials, configuration) abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Fatal(_))
    }
}

/// A single upstream record did not have the expected shape.
#[derive(Debug, Clone, Error)]
#[error("unexpected record shape for '{entity}': {reason}")]
pub struct DataShapeError {
    pub entity: String,
    pub reason: String,
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("point kind mismatch for {key}: stored {stored}, incoming {incoming}")]
    PointKindMismatch {
        key: String,
        stored: PointKind,
        incoming: PointKind,
    },

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Errors that terminate a run. Everything else is reported per unit.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error from provider '{provider}': {detail}")]
    Fetch { provider: String, detail: String },

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}
