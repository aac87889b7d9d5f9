//! Persisted sentinel samples and their baselines.

use super::{decode_ts, encode_ts, SyncStore};
use crate::domain::{
    EntityId, PointKind, SentinelReading, SentinelRole, SentinelSample, SentinelValue, SourceId,
    SyncPoint,
};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

fn corrupt(detail: String) -> StoreError {
    StoreError::Corrupt {
        table: "sentinels",
        detail,
    }
}

fn encode_value(value: &SentinelValue) -> (&'static str, Option<f64>, Option<String>) {
    match value {
        SentinelValue::Numeric(v) => ("numeric", Some(*v), None),
        SentinelValue::Categorical(s) => ("categorical", None, Some(s.clone())),
        SentinelValue::Missing => ("missing", None, None),
    }
}

fn decode_value(
    kind: &str,
    num: Option<f64>,
    text: Option<String>,
) -> Result<SentinelValue, StoreError> {
    match (kind, num, text) {
        ("numeric", Some(v), _) => Ok(SentinelValue::Numeric(v)),
        ("categorical", _, Some(s)) => Ok(SentinelValue::Categorical(s)),
        ("missing", _, _) => Ok(SentinelValue::Missing),
        (kind, ..) => Err(corrupt(format!("bad sentinel value kind {kind:?}"))),
    }
}

fn insert(conn: &Connection, sample: &SentinelSample) -> Result<(), StoreError> {
    let (value_kind, value_num, value_text) = encode_value(&sample.baseline.value);
    conn.execute(
        "INSERT INTO sentinels
            (source, entity, role, point_kind, point, value_kind, value_num, value_text,
             baseline_fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (source, entity) DO UPDATE SET
            role = excluded.role,
            point_kind = excluded.point_kind,
            point = excluded.point,
            value_kind = excluded.value_kind,
            value_num = excluded.value_num,
            value_text = excluded.value_text,
            baseline_fetched_at = excluded.baseline_fetched_at",
        params![
            sample.source.as_str(),
            sample.entity.as_str(),
            sample.role.as_str(),
            sample.baseline.point.map(|p| p.kind().as_str()),
            sample.baseline.point.map(|p| p.encode()),
            value_kind,
            value_num,
            value_text,
            encode_ts(sample.baseline_fetched_at)
        ],
    )?;
    Ok(())
}

impl SyncStore {
    /// Replace the whole sample for `source` atomically.
    pub fn replace_sentinels(
        &mut self,
        source: &SourceId,
        samples: &[SentinelSample],
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM sentinels WHERE source = ?1",
            params![source.as_str()],
        )?;
        for sample in samples {
            insert(&tx, sample)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Overwrite baselines of existing sentinels (after a full sync).
    pub fn refresh_baselines(
        &mut self,
        source: &SourceId,
        readings: &[(EntityId, SentinelReading)],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut updated = 0;
        for (entity, reading) in readings {
            let (value_kind, value_num, value_text) = encode_value(&reading.value);
            updated += tx.execute(
                "UPDATE sentinels
                 SET point_kind = ?3, point = ?4, value_kind = ?5, value_num = ?6,
                     value_text = ?7, baseline_fetched_at = ?8
                 WHERE source = ?1 AND entity = ?2",
                params![
                    source.as_str(),
                    entity.as_str(),
                    reading.point.map(|p| p.kind().as_str()),
                    reading.point.map(|p| p.encode()),
                    value_kind,
                    value_num,
                    value_text,
                    encode_ts(fetched_at)
                ],
            )?;
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn sentinels(&self, source: &SourceId) -> Result<Vec<SentinelSample>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity, role, point_kind, point, value_kind, value_num, value_text,
                    baseline_fetched_at
             FROM sentinels WHERE source = ?1 ORDER BY role, entity",
        )?;
        let rows = stmt.query_map(params![source.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<f64>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (entity, role, point_kind, point, value_kind, value_num, value_text, fetched) =
                row?;
            let role = SentinelRole::parse(&role)
                .ok_or_else(|| corrupt(format!("bad role {role:?}")))?;
            let point = match (point_kind, point) {
                (Some(k), Some(p)) => Some(
                    PointKind::parse(&k)
                        .and_then(|k| SyncPoint::decode(k, &p))
                        .ok_or_else(|| corrupt(format!("bad point {k}:{p}")))?,
                ),
                _ => None,
            };
            out.push(SentinelSample {
                source: source.clone(),
                entity: EntityId::new(entity),
                role,
                baseline: SentinelReading {
                    point,
                    value: decode_value(&value_kind, value_num, value_text)?,
                },
                baseline_fetched_at: decode_ts("sentinels", &fetched)?,
            });
        }
        Ok(out)
    }
}
