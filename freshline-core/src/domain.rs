//! Domain types shared by every layer: identifiers, sync points, tracking
//! records, observations and freshness state.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Upstream provider or dataset grouping many entities under one quota.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Smallest trackable item: a ticker symbol or a statistical series id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of data tracked for an entity (e.g. `daily_bars`, `observations`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a tracking record and of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackingKey {
    pub entity: EntityId,
    pub category: Category,
}

impl TrackingKey {
    pub fn new(entity: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            entity: EntityId::new(entity),
            category: Category::new(category),
        }
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.category)
    }
}

/// Which representation a sync point uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Date,
    Version,
}

impl PointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PointKind::Date => "date",
            PointKind::Version => "version",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "date" => Some(PointKind::Date),
            "version" => Some(PointKind::Version),
            _ => None,
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last synchronized position of an entity: a calendar date or a version marker.
///
/// A single tracking key never mixes kinds; the store rejects a kind switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SyncPoint {
    Date(NaiveDate),
    Version(i64),
}

impl SyncPoint {
    pub fn kind(&self) -> PointKind {
        match self {
            SyncPoint::Date(_) => PointKind::Date,
            SyncPoint::Version(_) => PointKind::Version,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            SyncPoint::Date(d) => Some(*d),
            SyncPoint::Version(_) => None,
        }
    }

    /// Text form used in storage. Dates are ISO-8601 so they sort lexically.
    pub fn encode(&self) -> String {
        match self {
            SyncPoint::Date(d) => d.format("%Y-%m-%d").to_string(),
            SyncPoint::Version(v) => format!("{v:020}"),
        }
    }

    pub fn decode(kind: PointKind, text: &str) -> Option<Self> {
        match kind {
            PointKind::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(SyncPoint::Date),
            PointKind::Version => text.trim().parse::<i64>().ok().map(SyncPoint::Version),
        }
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPoint::Date(d) => write!(f, "{d}"),
            SyncPoint::Version(v) => write!(f, "v{v}"),
        }
    }
}

/// Incremental runs resume from the tracked point; force runs refill history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Force,
}

impl SyncMode {
    pub fn from_force(force: bool) -> Self {
        if force {
            SyncMode::Force
        } else {
            SyncMode::Incremental
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Force => "force",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(SyncMode::Incremental),
            "force" => Some(SyncMode::Force),
            _ => None,
        }
    }
}

/// Inclusive calendar window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaiveDateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl NaiveDateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Durable per-(entity, category) sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub key: TrackingKey,
    pub last_synced_point: SyncPoint,
    pub mode: SyncMode,
    pub updated_at: DateTime<Utc>,
    pub run_count: u64,
}

/// One upstream record before mapping: the entity it belongs to plus the raw
/// JSON fields the provider returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity: EntityId,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: EntityId::new(entity),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}

/// A mapped, storable record: numeric fields (nullable) plus categorical labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity: EntityId,
    pub category: Category,
    pub point: SyncPoint,
    pub values: BTreeMap<String, Option<f64>>,
    pub labels: BTreeMap<String, String>,
}

impl Observation {
    /// Value of `field` as a sentinel comparison value. Numeric fields win over
    /// labels of the same name.
    pub fn sentinel_value(&self, field: &str) -> SentinelValue {
        match self.values.get(field) {
            Some(Some(v)) => SentinelValue::Numeric(*v),
            Some(None) => SentinelValue::Missing,
            None => match self.labels.get(field) {
                Some(label) => SentinelValue::Categorical(label.clone()),
                None => SentinelValue::Missing,
            },
        }
    }
}

/// Value recorded for a sentinel: continuous, categorical, or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SentinelValue {
    Numeric(f64),
    Categorical(String),
    Missing,
}

/// Sentinel reading: the newest point of a sampled entity and its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelReading {
    pub point: Option<SyncPoint>,
    pub value: SentinelValue,
}

impl SentinelReading {
    pub fn missing() -> Self {
        Self {
            point: None,
            value: SentinelValue::Missing,
        }
    }

    pub fn from_observation(obs: &Observation, field: &str) -> Self {
        Self {
            point: Some(obs.point),
            value: obs.sentinel_value(field),
        }
    }
}

/// Why an entity is part of the sentinel sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelRole {
    Aggregate,
    Diverse,
    Random,
}

impl SentinelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SentinelRole::Aggregate => "aggregate",
            SentinelRole::Diverse => "diverse",
            SentinelRole::Random => "random",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aggregate" => Some(SentinelRole::Aggregate),
            "diverse" => Some(SentinelRole::Diverse),
            "random" => Some(SentinelRole::Random),
            _ => None,
        }
    }
}

/// Persisted sentinel with its baseline reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelSample {
    pub source: SourceId,
    pub entity: EntityId,
    pub role: SentinelRole,
    pub baseline: SentinelReading,
    pub baseline_fetched_at: DateTime<Utc>,
}

/// Lifecycle of a source's freshness flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessState {
    Fresh,
    NeedsUpdate,
    Updating,
}

impl FreshnessState {
    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessState::Fresh => "fresh",
            FreshnessState::NeedsUpdate => "needs_update",
            FreshnessState::Updating => "updating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fresh" => Some(FreshnessState::Fresh),
            "needs_update" => Some(FreshnessState::NeedsUpdate),
            "updating" => Some(FreshnessState::Updating),
            _ => None,
        }
    }
}

/// Source-level freshness record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessStatus {
    pub source: SourceId,
    pub state: FreshnessState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_upstream_change_at: Option<DateTime<Utc>>,
    pub last_change_count: u32,
}

impl FreshnessStatus {
    pub fn fresh(source: SourceId) -> Self {
        Self {
            source,
            state: FreshnessState::Fresh,
            last_checked_at: None,
            last_upstream_change_at: None,
            last_change_count: 0,
        }
    }

    /// True until a completed full sync clears the flag.
    pub fn needs_full_update(&self) -> bool {
        self.state != FreshnessState::Fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_points_roundtrip_through_text() {
        let p = SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(p.encode(), "2024-03-09");
        assert_eq!(SyncPoint::decode(PointKind::Date, "2024-03-09"), Some(p));
    }

    #[test]
    fn version_points_are_zero_padded() {
        let p = SyncPoint::Version(42);
        assert_eq!(p.encode().len(), 20);
        assert_eq!(SyncPoint::decode(PointKind::Version, &p.encode()), Some(p));
    }

    #[test]
    fn points_order_by_value() {
        let a = SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        let b = SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert!(a < b);
    }

    #[test]
    fn sentinel_value_prefers_numeric_field() {
        let mut obs = Observation {
            entity: EntityId::new("CUUR0000SA0"),
            category: Category::new("observations"),
            point: SyncPoint::Version(1),
            values: BTreeMap::new(),
            labels: BTreeMap::new(),
        };
        obs.values.insert("value".into(), Some(310.3));
        obs.labels.insert("footnote".into(), "P".into());
        assert_eq!(obs.sentinel_value("value"), SentinelValue::Numeric(310.3));
        assert_eq!(
            obs.sentinel_value("footnote"),
            SentinelValue::Categorical("P".into())
        );
        assert_eq!(obs.sentinel_value("absent"), SentinelValue::Missing);
    }

    #[test]
    fn date_range_is_inclusive() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 2, day).unwrap();
        let r = NaiveDateRange::new(d(1), d(3));
        assert!(r.contains(d(1)) && r.contains(d(3)));
        assert!(!r.contains(d(4)));
        assert!(NaiveDateRange::new(d(3), d(1)).is_empty());
    }

    #[test]
    fn fresh_status_does_not_need_update() {
        let s = FreshnessStatus::fresh(SourceId::new("bls_cpi"));
        assert!(!s.needs_full_update());
    }
}
