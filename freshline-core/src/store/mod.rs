//! SQLite-backed durable state.
//!
//! One database holds every table the engine writes:
//! - `tracking`: one row per (source, entity, category), never deleted
//! - `sync_history`: append-only audit of every unit of work
//! - `observations`: idempotent upsert target keyed by natural key
//! - `empty_dates`: dates upstream answered with no data
//! - `freshness`: one row per source
//! - `sentinels`: up to k rows per source
//! - `quota_ledger`: requests spent per source and UTC day
//! - `unit_leases`: at most one in-flight unit per key across processes
//!
//! Every write to a key runs inside a `BEGIN IMMEDIATE` transaction so two
//! concurrent runs serialize on the database write lock.

mod freshness;
mod observations;
mod quota;
mod sentinels;
mod tracking;

pub use tracking::{HistoryEntry, RecordOutcome};

use crate::domain::{
    Category, NaiveDateRange, Observation, SourceId, SyncMode, SyncPoint, TrackingKey,
    TrackingRecord,
};
use crate::error::StoreError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS tracking (
    source      TEXT NOT NULL,
    entity      TEXT NOT NULL,
    category    TEXT NOT NULL,
    point_kind  TEXT NOT NULL,
    point       TEXT NOT NULL,
    mode        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    run_count   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (source, entity, category)
);

CREATE TABLE IF NOT EXISTS sync_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source      TEXT NOT NULL,
    entity      TEXT NOT NULL,
    category    TEXT NOT NULL,
    point_kind  TEXT,
    point       TEXT,
    mode        TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    run_id      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_history_key
    ON sync_history(source, entity, category, id);

CREATE TABLE IF NOT EXISTS observations (
    source      TEXT NOT NULL,
    entity      TEXT NOT NULL,
    category    TEXT NOT NULL,
    point_kind  TEXT NOT NULL,
    point       TEXT NOT NULL,
    payload     TEXT NOT NULL,
    PRIMARY KEY (source, entity, category, point)
);
CREATE INDEX IF NOT EXISTS idx_observations_points
    ON observations(source, category, point);

CREATE TABLE IF NOT EXISTS empty_dates (
    source      TEXT NOT NULL,
    category    TEXT NOT NULL,
    day         TEXT NOT NULL,
    checked_at  TEXT NOT NULL,
    PRIMARY KEY (source, category, day)
);

CREATE TABLE IF NOT EXISTS freshness (
    source                  TEXT PRIMARY KEY,
    state                   TEXT NOT NULL,
    needs_full_update       INTEGER NOT NULL,
    last_checked_at         TEXT,
    last_upstream_change_at TEXT,
    last_change_count       INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sentinels (
    source              TEXT NOT NULL,
    entity              TEXT NOT NULL,
    role                TEXT NOT NULL,
    point_kind          TEXT,
    point               TEXT,
    value_kind          TEXT NOT NULL,
    value_num           REAL,
    value_text          TEXT,
    baseline_fetched_at TEXT NOT NULL,
    PRIMARY KEY (source, entity)
);

CREATE TABLE IF NOT EXISTS quota_ledger (
    source  TEXT NOT NULL,
    day     TEXT NOT NULL,
    spent   INTEGER NOT NULL,
    PRIMARY KEY (source, day)
);

CREATE TABLE IF NOT EXISTS unit_leases (
    source      TEXT NOT NULL,
    entity      TEXT NOT NULL,
    category    TEXT NOT NULL,
    owner       TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    PRIMARY KEY (source, entity, category)
);
"#;

/// Handle to the sync database.
pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Corrupt {
                    table: "database",
                    detail: format!("cannot create {}: {e}", parent.display()),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Start the transaction for one unit of work. Dropping the returned
    /// handle without calling [`UnitTx::commit`] rolls everything back.
    pub fn unit(&mut self, source: &SourceId) -> Result<UnitTx<'_>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(UnitTx {
            tx,
            source: source.clone(),
        })
    }

    // ── Tracking ────────────────────────────────────────────────────

    pub fn get_sync_point(
        &self,
        source: &SourceId,
        key: &TrackingKey,
    ) -> Result<Option<SyncPoint>, StoreError> {
        Ok(tracking::read_record(&self.conn, source, key)?.map(|r| r.last_synced_point))
    }

    pub fn tracking_record(
        &self,
        source: &SourceId,
        key: &TrackingKey,
    ) -> Result<Option<TrackingRecord>, StoreError> {
        tracking::read_record(&self.conn, source, key)
    }

    pub fn tracking_records(&self, source: &SourceId) -> Result<Vec<TrackingRecord>, StoreError> {
        tracking::read_all(&self.conn, source)
    }

    /// Record a unit's new point in its own transaction.
    pub fn record_result(
        &mut self,
        source: &SourceId,
        key: &TrackingKey,
        new_point: SyncPoint,
        mode: SyncMode,
    ) -> Result<RecordOutcome, StoreError> {
        let tx = self.unit(source)?;
        let outcome = tx.record_result(key, new_point, mode)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Audit row for a unit that did not commit.
    pub fn append_history(
        &self,
        source: &SourceId,
        key: &TrackingKey,
        mode: SyncMode,
        outcome: &str,
        run_id: &str,
    ) -> Result<(), StoreError> {
        tracking::append_history(&self.conn, source, key, None, mode, outcome, run_id)
    }

    pub fn history(
        &self,
        source: &SourceId,
        key: &TrackingKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        tracking::read_history(&self.conn, source, key, limit)
    }

    // ── Observations ────────────────────────────────────────────────

    /// Idempotent upsert in its own transaction.
    pub fn upsert_observations(
        &mut self,
        source: &SourceId,
        records: &[Observation],
    ) -> Result<usize, StoreError> {
        let tx = self.unit(source)?;
        let n = tx.upsert_observations(records)?;
        tx.commit()?;
        Ok(n)
    }

    pub fn observations(
        &self,
        source: &SourceId,
        key: &TrackingKey,
    ) -> Result<Vec<Observation>, StoreError> {
        observations::load(&self.conn, source, key)
    }

    pub fn latest_observation(
        &self,
        source: &SourceId,
        key: &TrackingKey,
    ) -> Result<Option<Observation>, StoreError> {
        observations::latest(&self.conn, source, key)
    }

    /// Distinct dated points stored for a category within `range`.
    pub fn stored_dates(
        &self,
        source: &SourceId,
        category: &Category,
        range: NaiveDateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        observations::stored_dates(&self.conn, source, category, range)
    }

    pub fn latest_date(
        &self,
        source: &SourceId,
        category: &Category,
    ) -> Result<Option<NaiveDate>, StoreError> {
        observations::latest_date(&self.conn, source, category)
    }

    pub fn observation_count(&self, source: &SourceId) -> Result<u64, StoreError> {
        observations::count(&self.conn, source)
    }

    /// Remember that upstream had nothing for `date`.
    pub fn mark_empty_date(
        &mut self,
        source: &SourceId,
        category: &Category,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        observations::mark_empty(&self.conn, source, category, date, Utc::now())
    }

    /// Dates within `range` known to have no upstream data.
    pub fn empty_dates(
        &self,
        source: &SourceId,
        category: &Category,
        range: NaiveDateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        observations::empty_dates(&self.conn, source, category, range)
    }
}

/// Transaction scoped to one unit of work.
pub struct UnitTx<'a> {
    tx: Transaction<'a>,
    source: SourceId,
}

impl UnitTx<'_> {
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Upsert on the natural key. Returns the number of rows inserted or
    /// changed; re-applying identical records returns 0.
    pub fn upsert_observations(&self, records: &[Observation]) -> Result<usize, StoreError> {
        observations::upsert(&self.tx, &self.source, records)
    }

    pub fn get_sync_point(&self, key: &TrackingKey) -> Result<Option<SyncPoint>, StoreError> {
        Ok(tracking::read_record(&self.tx, &self.source, key)?.map(|r| r.last_synced_point))
    }

    /// Advance the tracking point. A point below the stored one is never
    /// written, whatever the mode.
    pub fn record_result(
        &self,
        key: &TrackingKey,
        new_point: SyncPoint,
        mode: SyncMode,
    ) -> Result<RecordOutcome, StoreError> {
        tracking::write_result(&self.tx, &self.source, key, new_point, mode, Utc::now())
    }

    pub fn append_history(
        &self,
        key: &TrackingKey,
        point: Option<SyncPoint>,
        mode: SyncMode,
        outcome: &str,
        run_id: &str,
    ) -> Result<(), StoreError> {
        tracking::append_history(&self.tx, &self.source, key, point, mode, outcome, run_id)
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }
}

// ── Shared row helpers ──────────────────────────────────────────────

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn decode_ts(table: &'static str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad timestamp {text:?}: {e}"),
        })
}

pub(crate) fn decode_optional_ts(
    table: &'static str,
    text: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    text.map(|t| decode_ts(table, &t)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, PointKind};
    use std::collections::BTreeMap;

    fn source() -> SourceId {
        SourceId::new("bls_cpi")
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn obs(entity: &str, day: u32, value: f64) -> Observation {
        let mut values = BTreeMap::new();
        values.insert("value".to_string(), Some(value));
        Observation {
            entity: EntityId::new(entity),
            category: Category::new("observations"),
            point: SyncPoint::Date(date(day)),
            values,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn schema_is_created_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        let store = SyncStore::open(&path).unwrap();
        assert_eq!(store.observation_count(&source()).unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let batch = vec![obs("A", 1, 1.0), obs("A", 2, 2.0), obs("B", 1, 3.0)];

        assert_eq!(store.upsert_observations(&source(), &batch).unwrap(), 3);
        let key = TrackingKey::new("A", "observations");
        let before = store.observations(&source(), &key).unwrap();

        assert_eq!(store.upsert_observations(&source(), &batch).unwrap(), 0);
        assert_eq!(store.observations(&source(), &key).unwrap(), before);
        assert_eq!(store.observation_count(&source()).unwrap(), 3);
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut store = SyncStore::open_in_memory().unwrap();
        store.upsert_observations(&source(), &[obs("A", 1, 1.0)]).unwrap();
        assert_eq!(store.upsert_observations(&source(), &[obs("A", 1, 1.5)]).unwrap(), 1);

        let key = TrackingKey::new("A", "observations");
        let rows = store.observations(&source(), &key).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["value"], Some(1.5));
    }

    #[test]
    fn dropped_unit_rolls_back() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let key = TrackingKey::new("A", "observations");
        {
            let tx = store.unit(&source()).unwrap();
            tx.upsert_observations(&[obs("A", 1, 1.0)]).unwrap();
            tx.record_result(&key, SyncPoint::Date(date(1)), SyncMode::Incremental)
                .unwrap();
        }
        assert_eq!(store.observation_count(&source()).unwrap(), 0);
        assert_eq!(store.get_sync_point(&source(), &key).unwrap(), None);
    }

    #[test]
    fn stored_dates_respect_range() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let batch = vec![obs("A", 2, 1.0), obs("B", 3, 1.0), obs("A", 9, 1.0)];
        store.upsert_observations(&source(), &batch).unwrap();

        let cat = Category::new("observations");
        let got = store
            .stored_dates(&source(), &cat, NaiveDateRange::new(date(1), date(5)))
            .unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![date(2), date(3)]);
        assert_eq!(store.latest_date(&source(), &cat).unwrap(), Some(date(9)));
    }

    #[test]
    fn empty_dates_are_remembered_once() {
        let mut store = SyncStore::open_in_memory().unwrap();
        let cat = Category::new("observations");
        store.mark_empty_date(&source(), &cat, date(5)).unwrap();
        store.mark_empty_date(&source(), &cat, date(5)).unwrap();
        store.mark_empty_date(&source(), &cat, date(20)).unwrap();

        let got = store
            .empty_dates(&source(), &cat, NaiveDateRange::new(date(1), date(10)))
            .unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![date(5)]);
        assert!(store
            .stored_dates(&source(), &cat, NaiveDateRange::new(date(1), date(10)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn latest_observation_is_highest_point() {
        let mut store = SyncStore::open_in_memory().unwrap();
        store
            .upsert_observations(&source(), &[obs("A", 4, 4.0), obs("A", 7, 7.0)])
            .unwrap();
        let latest = store
            .latest_observation(&source(), &TrackingKey::new("A", "observations"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.point.kind(), PointKind::Date);
        assert_eq!(latest.values["value"], Some(7.0));
    }
}
