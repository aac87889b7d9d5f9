//! Fetcher traits.
//!
//! Fetchers are the only code that talks to upstream providers. The
//! collector, backfill and sentinel monitor are written against these traits
//! so sources can be swapped or mocked in tests.

use crate::domain::{Category, EntityId, RawRecord, SyncPoint};
use crate::error::FetchError;
use chrono::NaiveDate;

/// Batch fetcher: one call covers many entities.
pub trait Fetcher: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Fetch the records of `entity_ids` for `category` newer than `since`
    /// when given. Providers with a coarse range (whole years) may return
    /// older records too; they are upserted idempotently.
    fn fetch(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        since: Option<SyncPoint>,
    ) -> Result<Vec<RawRecord>, FetchError>;

    /// Upstream requests one `fetch` call spends against the quota.
    fn request_cost(&self, _since: Option<SyncPoint>) -> u32 {
        1
    }

    /// Whether requests are currently allowed (circuit breaker closed).
    fn is_available(&self) -> bool {
        true
    }
}

/// Point fetcher: one request returns every entity's record for one date.
/// An empty result means upstream has no data for that date.
pub trait PointFetcher: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_point(&self, category: &Category, date: NaiveDate)
        -> Result<Vec<RawRecord>, FetchError>;

    fn is_available(&self) -> bool {
        true
    }
}
