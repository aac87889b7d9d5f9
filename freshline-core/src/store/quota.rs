//! Daily request ledger and per-key leases.
//!
//! Both are shared by every process pointing at the same database, so
//! reservations and lease grabs run under `BEGIN IMMEDIATE`.

use super::{decode_ts, encode_ts, SyncStore};
use crate::domain::{SourceId, TrackingKey};
use crate::error::StoreError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

fn read_spent(conn: &Connection, source: &SourceId, day: NaiveDate) -> Result<u32, StoreError> {
    let spent: Option<i64> = conn
        .query_row(
            "SELECT spent FROM quota_ledger WHERE source = ?1 AND day = ?2",
            params![source.as_str(), day.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(spent.unwrap_or(0).clamp(0, u32::MAX as i64) as u32)
}

fn write_spent(
    conn: &Connection,
    source: &SourceId,
    day: NaiveDate,
    spent: u32,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO quota_ledger (source, day, spent) VALUES (?1, ?2, ?3)
         ON CONFLICT (source, day) DO UPDATE SET spent = excluded.spent",
        params![source.as_str(), day.to_string(), spent as i64],
    )?;
    Ok(())
}

impl SyncStore {
    /// Requests already spent by `source` on `day` (UTC).
    pub fn spent_on(&self, source: &SourceId, day: NaiveDate) -> Result<u32, StoreError> {
        read_spent(&self.conn, source, day)
    }

    pub fn remaining_quota(
        &self,
        source: &SourceId,
        day: NaiveDate,
        limit: u32,
    ) -> Result<u32, StoreError> {
        Ok(limit.saturating_sub(self.spent_on(source, day)?))
    }

    /// Reserve up to `wanted` requests without exceeding `limit` for the day.
    /// Returns the number granted, possibly zero.
    pub fn reserve_requests(
        &mut self,
        source: &SourceId,
        day: NaiveDate,
        wanted: u32,
        limit: u32,
    ) -> Result<u32, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let spent = read_spent(&tx, source, day)?;
        let granted = wanted.min(limit.saturating_sub(spent));
        if granted > 0 {
            write_spent(&tx, source, day, spent + granted)?;
        }
        tx.commit()?;
        Ok(granted)
    }

    /// Hand back reserved requests that were never sent.
    pub fn refund_requests(
        &mut self,
        source: &SourceId,
        day: NaiveDate,
        unused: u32,
    ) -> Result<(), StoreError> {
        if unused == 0 {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let spent = read_spent(&tx, source, day)?;
        write_spent(&tx, source, day, spent.saturating_sub(unused))?;
        tx.commit()?;
        Ok(())
    }

    /// Take the lease on `key` for `ttl`. Succeeds when no lease exists, the
    /// current one has expired, or `owner` already holds it.
    pub fn acquire_lease(
        &mut self,
        source: &SourceId,
        key: &TrackingKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM unit_leases
                 WHERE source = ?1 AND entity = ?2 AND category = ?3",
                params![source.as_str(), key.entity.as_str(), key.category.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((holder, expires_at)) = current {
            let expires_at = decode_ts("unit_leases", &expires_at)?;
            if holder != owner && expires_at > now {
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO unit_leases (source, entity, category, owner, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (source, entity, category) DO UPDATE SET
                owner = excluded.owner, expires_at = excluded.expires_at",
            params![
                source.as_str(),
                key.entity.as_str(),
                key.category.as_str(),
                owner,
                encode_ts(now + ttl)
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Release a lease held by `owner`. Someone else's lease is left alone.
    pub fn release_lease(
        &mut self,
        source: &SourceId,
        key: &TrackingKey,
        owner: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM unit_leases
             WHERE source = ?1 AND entity = ?2 AND category = ?3 AND owner = ?4",
            params![
                source.as_str(),
                key.entity.as_str(),
                key.category.as_str(),
                owner
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SourceId {
        SourceId::new("prices")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn reservations_never_exceed_limit() {
        let mut store = SyncStore::open_in_memory().unwrap();
        assert_eq!(store.reserve_requests(&src(), today(), 6, 10).unwrap(), 6);
        assert_eq!(store.reserve_requests(&src(), today(), 6, 10).unwrap(), 4);
        assert_eq!(store.reserve_requests(&src(), today(), 1, 10).unwrap(), 0);
        assert_eq!(store.spent_on(&src(), today()).unwrap(), 10);
    }

    #[test]
    fn ledger_is_per_day_and_source() {
        let mut store = SyncStore::open_in_memory().unwrap();
        store.reserve_requests(&src(), today(), 5, 5).unwrap();
        let tomorrow = today().succ_opt().unwrap();
        assert_eq!(store.remaining_quota(&src(), tomorrow, 5).unwrap(), 5);
        assert_eq!(
            store.remaining_quota(&SourceId::new("other"), today(), 5).unwrap(),
            5
        );
    }

    #[test]
    fn refunds_return_unused_requests() {
        let mut store = SyncStore::open_in_memory().unwrap();
        store.reserve_requests(&src(), today(), 8, 10).unwrap();
        store.refund_requests(&src(), today(), 3).unwrap();
        assert_eq!(store.spent_on(&src(), today()).unwrap(), 5);
    }

    #[test]
    fn lease_blocks_other_owners_until_expiry() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let key = TrackingKey::new("AAPL", "daily_bars");
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        assert!(store.acquire_lease(&src(), &key, "run-a", ttl, now).unwrap());
        assert!(!store.acquire_lease(&src(), &key, "run-b", ttl, now).unwrap());
        assert!(store.acquire_lease(&src(), &key, "run-a", ttl, now).unwrap());

        let later = now + Duration::minutes(11);
        assert!(store.acquire_lease(&src(), &key, "run-b", ttl, later).unwrap());

        store.release_lease(&src(), &key, "run-a").unwrap();
        assert!(!store.acquire_lease(&src(), &key, "run-c", ttl, later).unwrap());
        store.release_lease(&src(), &key, "run-b").unwrap();
        assert!(store.acquire_lease(&src(), &key, "run-c", ttl, later).unwrap());
    }
}
