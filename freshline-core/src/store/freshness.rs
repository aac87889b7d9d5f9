//! Source-level freshness flag.
//!
//! Fresh -> NeedsUpdate when a check detects change, NeedsUpdate -> Updating
//! when a full update starts, and back to Fresh only through a
//! [`FullSyncReceipt`]. A failed update returns to NeedsUpdate.

use super::{decode_optional_ts, encode_ts, SyncStore};
use crate::domain::{FreshnessState, FreshnessStatus, SourceId};
use crate::error::StoreError;
use crate::executor::FullSyncReceipt;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

fn read(conn: &Connection, source: &SourceId) -> Result<FreshnessStatus, StoreError> {
    let row: Option<(String, Option<String>, Option<String>, i64)> = conn
        .query_row(
            "SELECT state, last_checked_at, last_upstream_change_at, last_change_count
             FROM freshness WHERE source = ?1",
            params![source.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    let Some((state, checked, changed, count)) = row else {
        return Ok(FreshnessStatus::fresh(source.clone()));
    };
    let state = FreshnessState::parse(&state).ok_or_else(|| StoreError::Corrupt {
        table: "freshness",
        detail: format!("bad state {state:?}"),
    })?;
    Ok(FreshnessStatus {
        source: source.clone(),
        state,
        last_checked_at: decode_optional_ts("freshness", checked)?,
        last_upstream_change_at: decode_optional_ts("freshness", changed)?,
        last_change_count: count.clamp(0, u32::MAX as i64) as u32,
    })
}

fn write(conn: &Connection, status: &FreshnessStatus) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO freshness
            (source, state, needs_full_update, last_checked_at,
             last_upstream_change_at, last_change_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (source) DO UPDATE SET
            state = excluded.state,
            needs_full_update = excluded.needs_full_update,
            last_checked_at = excluded.last_checked_at,
            last_upstream_change_at = excluded.last_upstream_change_at,
            last_change_count = excluded.last_change_count",
        params![
            status.source.as_str(),
            status.state.as_str(),
            status.needs_full_update(),
            status.last_checked_at.map(encode_ts),
            status.last_upstream_change_at.map(encode_ts),
            status.last_change_count as i64
        ],
    )?;
    Ok(())
}

impl SyncStore {
    /// Current flag; a source never checked is fresh.
    pub fn freshness(&self, source: &SourceId) -> Result<FreshnessStatus, StoreError> {
        read(&self.conn, source)
    }

    /// Record a sentinel check. Any change raises the flag; a clean check
    /// never lowers it.
    pub fn record_check(
        &mut self,
        source: &SourceId,
        changed: u32,
        now: DateTime<Utc>,
    ) -> Result<FreshnessStatus, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut status = read(&tx, source)?;
        status.last_checked_at = Some(now);
        status.last_change_count = changed;
        if changed > 0 {
            status.last_upstream_change_at = Some(now);
            if status.state == FreshnessState::Fresh {
                status.state = FreshnessState::NeedsUpdate;
            }
        }
        write(&tx, &status)?;
        tx.commit()?;
        Ok(status)
    }

    /// NeedsUpdate -> Updating. Returns false when the source is fresh.
    /// An interrupted update (already Updating) may be resumed.
    pub fn begin_full_update(&mut self, source: &SourceId) -> Result<bool, StoreError> {
        self.transition(source, |state| match state {
            FreshnessState::Fresh => None,
            FreshnessState::NeedsUpdate | FreshnessState::Updating => {
                Some(FreshnessState::Updating)
            }
        })
    }

    /// Updating -> NeedsUpdate after an incomplete full sync.
    pub fn abandon_full_update(&mut self, source: &SourceId) -> Result<bool, StoreError> {
        self.transition(source, |state| match state {
            FreshnessState::Updating => Some(FreshnessState::NeedsUpdate),
            _ => None,
        })
    }

    /// Lower the flag. Only a completed full sync can produce a receipt.
    pub fn clear_after_full_sync(&mut self, receipt: FullSyncReceipt) -> Result<(), StoreError> {
        let source = receipt.source().clone();
        self.transition(&source, |_| Some(FreshnessState::Fresh))?;
        Ok(())
    }

    fn transition(
        &mut self,
        source: &SourceId,
        next: impl FnOnce(FreshnessState) -> Option<FreshnessState>,
    ) -> Result<bool, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut status = read(&tx, source)?;
        let Some(state) = next(status.state) else {
            return Ok(false);
        };
        status.state = state;
        write(&tx, &status)?;
        tx.commit()?;
        Ok(true)
    }
}
