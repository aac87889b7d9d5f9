//! Tracking records and the sync-history audit trail.

use super::{decode_ts, encode_ts};
use crate::domain::{PointKind, SourceId, SyncMode, SyncPoint, TrackingKey, TrackingRecord};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// What `record_result` did to the stored point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    Advanced { from: SyncPoint },
    Unchanged,
    RegressionRejected { stored: SyncPoint },
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Created => "created",
            RecordOutcome::Advanced { .. } => "advanced",
            RecordOutcome::Unchanged => "unchanged",
            RecordOutcome::RegressionRejected { .. } => "regression_rejected",
        }
    }
}

/// One row of `sync_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub key: TrackingKey,
    pub point: Option<SyncPoint>,
    pub mode: SyncMode,
    pub outcome: String,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
}

type TrackingRow = (String, String, String, String, String, String, i64);

fn tracking_row(r: &Row<'_>) -> rusqlite::Result<TrackingRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
    ))
}

fn decode_point(table: &'static str, kind: &str, text: &str) -> Result<SyncPoint, StoreError> {
    PointKind::parse(kind)
        .and_then(|k| SyncPoint::decode(k, text))
        .ok_or_else(|| StoreError::Corrupt {
            table,
            detail: format!("bad point {kind}:{text}"),
        })
}

fn decode_mode(table: &'static str, text: &str) -> Result<SyncMode, StoreError> {
    SyncMode::parse(text).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("bad mode {text:?}"),
    })
}

fn to_record(row: TrackingRow) -> Result<TrackingRecord, StoreError> {
    let (entity, category, kind, point, mode, updated_at, run_count) = row;
    Ok(TrackingRecord {
        key: TrackingKey::new(entity, category),
        last_synced_point: decode_point("tracking", &kind, &point)?,
        mode: decode_mode("tracking", &mode)?,
        updated_at: decode_ts("tracking", &updated_at)?,
        run_count: run_count.max(0) as u64,
    })
}

pub(crate) fn read_record(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
) -> Result<Option<TrackingRecord>, StoreError> {
    let row: Option<TrackingRow> = conn
        .query_row(
            "SELECT entity, category, point_kind, point, mode, updated_at, run_count
             FROM tracking WHERE source = ?1 AND entity = ?2 AND category = ?3",
            params![source.as_str(), key.entity.as_str(), key.category.as_str()],
            tracking_row,
        )
        .optional()?;
    row.map(to_record).transpose()
}

pub(crate) fn read_all(
    conn: &Connection,
    source: &SourceId,
) -> Result<Vec<TrackingRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT entity, category, point_kind, point, mode, updated_at, run_count
         FROM tracking WHERE source = ?1 ORDER BY entity, category",
    )?;
    let rows = stmt.query_map(params![source.as_str()], tracking_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(to_record(row?)?);
    }
    Ok(out)
}

pub(crate) fn write_result(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
    new_point: SyncPoint,
    mode: SyncMode,
    now: DateTime<Utc>,
) -> Result<RecordOutcome, StoreError> {
    let ids = (source.as_str(), key.entity.as_str(), key.category.as_str());

    let Some(existing) = read_record(conn, source, key)? else {
        conn.execute(
            "INSERT INTO tracking
                (source, entity, category, point_kind, point, mode, updated_at, run_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                ids.0,
                ids.1,
                ids.2,
                new_point.kind().as_str(),
                new_point.encode(),
                mode.as_str(),
                encode_ts(now)
            ],
        )?;
        return Ok(RecordOutcome::Created);
    };

    let stored = existing.last_synced_point;
    if stored.kind() != new_point.kind() {
        return Err(StoreError::PointKindMismatch {
            key: key.to_string(),
            stored: stored.kind(),
            incoming: new_point.kind(),
        });
    }

    if new_point > stored {
        conn.execute(
            "UPDATE tracking
             SET point = ?4, mode = ?5, updated_at = ?6, run_count = run_count + 1
             WHERE source = ?1 AND entity = ?2 AND category = ?3",
            params![ids.0, ids.1, ids.2, new_point.encode(), mode.as_str(), encode_ts(now)],
        )?;
        return Ok(RecordOutcome::Advanced { from: stored });
    }

    // Point stays put; the run is still counted.
    conn.execute(
        "UPDATE tracking
         SET mode = ?4, updated_at = ?5, run_count = run_count + 1
         WHERE source = ?1 AND entity = ?2 AND category = ?3",
        params![ids.0, ids.1, ids.2, mode.as_str(), encode_ts(now)],
    )?;
    if new_point == stored {
        Ok(RecordOutcome::Unchanged)
    } else {
        Ok(RecordOutcome::RegressionRejected { stored })
    }
}

pub(crate) fn append_history(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
    point: Option<SyncPoint>,
    mode: SyncMode,
    outcome: &str,
    run_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_history
            (source, entity, category, point_kind, point, mode, outcome, run_id, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            source.as_str(),
            key.entity.as_str(),
            key.category.as_str(),
            point.map(|p| p.kind().as_str()),
            point.map(|p| p.encode()),
            mode.as_str(),
            outcome,
            run_id,
            encode_ts(Utc::now())
        ],
    )?;
    Ok(())
}

/// Newest entries first.
pub(crate) fn read_history(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
    limit: usize,
) -> Result<Vec<HistoryEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT point_kind, point, mode, outcome, run_id, recorded_at
         FROM sync_history
         WHERE source = ?1 AND entity = ?2 AND category = ?3
         ORDER BY id DESC LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![
            source.as_str(),
            key.entity.as_str(),
            key.category.as_str(),
            limit as i64
        ],
        |r| {
            Ok((
                r.get::<_, Option<String>>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        },
    )?;

    let mut out = Vec::new();
    for row in rows {
        let (kind, point, mode, outcome, run_id, recorded_at) = row?;
        let point = match (kind, point) {
            (Some(k), Some(p)) => Some(decode_point("sync_history", &k, &p)?),
            _ => None,
        };
        out.push(HistoryEntry {
            key: key.clone(),
            point,
            mode: decode_mode("sync_history", &mode)?,
            outcome,
            run_id,
            recorded_at: decode_ts("sync_history", &recorded_at)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::domain::{SourceId, SyncMode, SyncPoint, TrackingKey};
    use crate::error::StoreError;
    use crate::store::{RecordOutcome, SyncStore};
    use chrono::NaiveDate;

    fn day(d: u32) -> SyncPoint {
        SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
    }

    fn setup() -> (SyncStore, SourceId, TrackingKey) {
        (
            SyncStore::open_in_memory().unwrap(),
            SourceId::new("prices"),
            TrackingKey::new("AAPL", "daily_bars"),
        )
    }

    #[test]
    fn first_write_creates_record() {
        let (mut store, src, key) = setup();
        assert_eq!(store.get_sync_point(&src, &key).unwrap(), None);
        let out = store
            .record_result(&src, &key, day(10), SyncMode::Incremental)
            .unwrap();
        assert_eq!(out, RecordOutcome::Created);
        assert_eq!(store.get_sync_point(&src, &key).unwrap(), Some(day(10)));
    }

    #[test]
    fn points_only_move_forward() {
        let (mut store, src, key) = setup();
        store.record_result(&src, &key, day(10), SyncMode::Incremental).unwrap();

        let out = store.record_result(&src, &key, day(15), SyncMode::Incremental).unwrap();
        assert_eq!(out, RecordOutcome::Advanced { from: day(10) });

        let out = store.record_result(&src, &key, day(12), SyncMode::Force).unwrap();
        assert_eq!(out, RecordOutcome::RegressionRejected { stored: day(15) });
        assert_eq!(store.get_sync_point(&src, &key).unwrap(), Some(day(15)));

        let out = store.record_result(&src, &key, day(15), SyncMode::Incremental).unwrap();
        assert_eq!(out, RecordOutcome::Unchanged);

        let rec = store.tracking_record(&src, &key).unwrap().unwrap();
        assert_eq!(rec.run_count, 4);
    }

    #[test]
    fn kind_switch_is_refused() {
        let (mut store, src, key) = setup();
        store.record_result(&src, &key, day(1), SyncMode::Incremental).unwrap();
        let err = store
            .record_result(&src, &key, SyncPoint::Version(3), SyncMode::Incremental)
            .unwrap_err();
        assert!(matches!(err, StoreError::PointKindMismatch { .. }));
    }

    #[test]
    fn keys_are_isolated() {
        let (mut store, src, key) = setup();
        let other = TrackingKey::new("MSFT", "daily_bars");
        store.record_result(&src, &key, day(5), SyncMode::Incremental).unwrap();
        assert_eq!(store.get_sync_point(&src, &other).unwrap(), None);
        assert_eq!(
            store.get_sync_point(&SourceId::new("other"), &key).unwrap(),
            None
        );
        assert_eq!(store.tracking_records(&src).unwrap().len(), 1);
    }

    #[test]
    fn history_is_newest_first() {
        let (store, src, key) = setup();
        store.append_history(&src, &key, SyncMode::Incremental, "failed", "run-1").unwrap();
        store.append_history(&src, &key, SyncMode::Force, "skipped", "run-2").unwrap();
        let rows = store.history(&src, &key, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].run_id, "run-2");
        assert_eq!(rows[0].mode, SyncMode::Force);
        assert_eq!(rows[1].outcome, "failed");
        assert!(rows[0].point.is_none());
    }
}
