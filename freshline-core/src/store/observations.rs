//! Observation rows, keyed by (source, entity, category, point).

use crate::domain::{
    Category, EntityId, NaiveDateRange, Observation, PointKind, SourceId, SyncPoint, TrackingKey,
};
use crate::error::StoreError;
use super::encode_ts;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// JSON column. BTreeMaps keep the encoding canonical, so an identical record
/// always serializes to an identical payload.
#[derive(Serialize, Deserialize)]
struct Payload {
    values: BTreeMap<String, Option<f64>>,
    labels: BTreeMap<String, String>,
}

const UPSERT: &str = "
INSERT INTO observations (source, entity, category, point_kind, point, payload)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (source, entity, category, point) DO UPDATE
    SET point_kind = excluded.point_kind, payload = excluded.payload
    WHERE observations.payload IS NOT excluded.payload";

pub(crate) fn upsert(
    conn: &Connection,
    source: &SourceId,
    records: &[Observation],
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(UPSERT)?;
    let mut changed = 0;
    for obs in records {
        let payload = serde_json::to_string(&Payload {
            values: obs.values.clone(),
            labels: obs.labels.clone(),
        })
        .map_err(|e| StoreError::Corrupt {
            table: "observations",
            detail: format!("cannot encode payload for {}: {e}", obs.entity),
        })?;
        changed += stmt.execute(params![
            source.as_str(),
            obs.entity.as_str(),
            obs.category.as_str(),
            obs.point.kind().as_str(),
            obs.point.encode(),
            payload
        ])?;
    }
    Ok(changed)
}

type ObservationRow = (String, String, String, String, String);

fn observation_row(r: &Row<'_>) -> rusqlite::Result<ObservationRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn to_observation(row: ObservationRow) -> Result<Observation, StoreError> {
    let (entity, category, kind, point, payload) = row;
    let point = PointKind::parse(&kind)
        .and_then(|k| SyncPoint::decode(k, &point))
        .ok_or_else(|| StoreError::Corrupt {
            table: "observations",
            detail: format!("bad point {kind}:{point}"),
        })?;
    let payload: Payload = serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
        table: "observations",
        detail: format!("bad payload for {entity}: {e}"),
    })?;
    Ok(Observation {
        entity: EntityId::new(entity),
        category: Category::new(category),
        point,
        values: payload.values,
        labels: payload.labels,
    })
}

/// All observations of a key, oldest point first.
pub(crate) fn load(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
) -> Result<Vec<Observation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT entity, category, point_kind, point, payload FROM observations
         WHERE source = ?1 AND entity = ?2 AND category = ?3 ORDER BY point",
    )?;
    let rows = stmt.query_map(
        params![source.as_str(), key.entity.as_str(), key.category.as_str()],
        observation_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(to_observation(row?)?);
    }
    Ok(out)
}

pub(crate) fn latest(
    conn: &Connection,
    source: &SourceId,
    key: &TrackingKey,
) -> Result<Option<Observation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT entity, category, point_kind, point, payload FROM observations
         WHERE source = ?1 AND entity = ?2 AND category = ?3
         ORDER BY point DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(
        params![source.as_str(), key.entity.as_str(), key.category.as_str()],
        observation_row,
    )?;
    match rows.next() {
        Some(row) => Ok(Some(to_observation(row?)?)),
        None => Ok(None),
    }
}

pub(crate) fn stored_dates(
    conn: &Connection,
    source: &SourceId,
    category: &Category,
    range: NaiveDateRange,
) -> Result<BTreeSet<NaiveDate>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT point FROM observations
         WHERE source = ?1 AND category = ?2 AND point_kind = 'date'
           AND point >= ?3 AND point <= ?4",
    )?;
    let rows = stmt.query_map(
        params![
            source.as_str(),
            category.as_str(),
            SyncPoint::Date(range.start).encode(),
            SyncPoint::Date(range.end).encode()
        ],
        |r| r.get::<_, String>(0),
    )?;
    let mut out = BTreeSet::new();
    for row in rows {
        let text = row?;
        let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| {
            StoreError::Corrupt {
                table: "observations",
                detail: format!("bad date {text:?}: {e}"),
            }
        })?;
        out.insert(date);
    }
    Ok(out)
}

pub(crate) fn latest_date(
    conn: &Connection,
    source: &SourceId,
    category: &Category,
) -> Result<Option<NaiveDate>, StoreError> {
    let text: Option<String> = conn.query_row(
        "SELECT MAX(point) FROM observations
         WHERE source = ?1 AND category = ?2 AND point_kind = 'date'",
        params![source.as_str(), category.as_str()],
        |r| r.get(0),
    )?;
    text.map(|t| {
        NaiveDate::parse_from_str(&t, "%Y-%m-%d").map_err(|e| StoreError::Corrupt {
            table: "observations",
            detail: format!("bad date {t:?}: {e}"),
        })
    })
    .transpose()
}

pub(crate) fn mark_empty(
    conn: &Connection,
    source: &SourceId,
    category: &Category,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO empty_dates (source, category, day, checked_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (source, category, day) DO UPDATE SET checked_at = excluded.checked_at",
        params![
            source.as_str(),
            category.as_str(),
            SyncPoint::Date(date).encode(),
            encode_ts(now)
        ],
    )?;
    Ok(())
}

pub(crate) fn empty_dates(
    conn: &Connection,
    source: &SourceId,
    category: &Category,
    range: NaiveDateRange,
) -> Result<BTreeSet<NaiveDate>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT day FROM empty_dates
         WHERE source = ?1 AND category = ?2 AND day >= ?3 AND day <= ?4",
    )?;
    let rows = stmt.query_map(
        params![
            source.as_str(),
            category.as_str(),
            SyncPoint::Date(range.start).encode(),
            SyncPoint::Date(range.end).encode()
        ],
        |r| r.get::<_, String>(0),
    )?;
    let mut out = BTreeSet::new();
    for row in rows {
        let text = row?;
        let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| {
            StoreError::Corrupt {
                table: "empty_dates",
                detail: format!("bad date {text:?}: {e}"),
            }
        })?;
        out.insert(date);
    }
    Ok(out)
}

pub(crate) fn count(conn: &Connection, source: &SourceId) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE source = ?1",
        params![source.as_str()],
        |r| r.get(0),
    )?;
    Ok(n.max(0) as u64)
}
