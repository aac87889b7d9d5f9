//! Per-run view of a source's daily request quota.
//!
//! The ledger in the store is the source of truth; a budget reserves from it
//! before every upstream request so concurrent runs against the same source
//! cannot spend the same requests twice.

use chrono::{NaiveDate, Utc};
use freshline_core::domain::SourceId;
use freshline_core::error::StoreError;
use freshline_core::store::SyncStore;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RequestBudget {
    source: SourceId,
    day: NaiveDate,
    limit: u32,
    used: u32,
}

impl RequestBudget {
    /// Budget for today (UTC).
    pub fn new(source: SourceId, limit: u32) -> Self {
        Self::for_day(source, Utc::now().date_naive(), limit)
    }

    pub fn for_day(source: SourceId, day: NaiveDate, limit: u32) -> Self {
        Self {
            source,
            day,
            limit,
            used: 0,
        }
    }

    pub fn remaining(&self, store: &SyncStore) -> Result<u32, StoreError> {
        store.remaining_quota(&self.source, self.day, self.limit)
    }

    /// Reserve `n` requests, all or nothing.
    pub fn reserve(&mut self, store: &mut SyncStore, n: u32) -> Result<bool, StoreError> {
        let granted = store.reserve_requests(&self.source, self.day, n, self.limit)?;
        if granted < n {
            store.refund_requests(&self.source, self.day, granted)?;
            debug!(source = %self.source, wanted = n, granted, "request budget exhausted");
            return Ok(false);
        }
        self.used += n;
        Ok(true)
    }

    /// Return requests that were reserved but never sent.
    pub fn refund(&mut self, store: &mut SyncStore, n: u32) -> Result<(), StoreError> {
        let n = n.min(self.used);
        store.refund_requests(&self.source, self.day, n)?;
        self.used -= n;
        Ok(())
    }

    /// Requests this run has spent.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Seconds until the quota day rolls over.
    pub fn resets_in_secs(&self) -> u64 {
        let next = self
            .day
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc());
        match next {
            Some(next) => (next - Utc::now()).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_all_or_nothing() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut budget = RequestBudget::for_day(SourceId::new("cpi"), day, 5);

        assert!(budget.reserve(&mut store, 3).unwrap());
        assert!(!budget.reserve(&mut store, 3).unwrap());
        assert_eq!(budget.used(), 3);
        assert_eq!(budget.remaining(&store).unwrap(), 2);

        budget.refund(&mut store, 1).unwrap();
        assert_eq!(budget.used(), 2);
        assert_eq!(budget.remaining(&store).unwrap(), 3);
    }

    #[test]
    fn budgets_share_the_ledger() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut a = RequestBudget::for_day(SourceId::new("cpi"), day, 4);
        let mut b = RequestBudget::for_day(SourceId::new("cpi"), day, 4);

        assert!(a.reserve(&mut store, 3).unwrap());
        assert!(b.reserve(&mut store, 1).unwrap());
        assert!(!b.reserve(&mut store, 1).unwrap());
    }
}
