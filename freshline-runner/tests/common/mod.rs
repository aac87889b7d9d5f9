//! Shared fixtures: scripted upstreams and source configurations.

#![allow(dead_code)]

use chrono::{Duration, NaiveDate, Utc};
use freshline_core::data::{Fetcher, PointFetcher};
use freshline_core::domain::{Category, EntityId, RawRecord, SyncPoint};
use freshline_core::error::FetchError;
use freshline_runner::config::{FreshlineConfig, SourceConfig};
use freshline_runner::sources::{load_catalog, SourceHandle, Upstream};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Day `n` of a month-long window ending today.
pub fn day(n: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(30 - n)
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn record(entity: &str, date: NaiveDate, value: f64) -> RawRecord {
    RawRecord::new(entity)
        .with("date", date.format("%Y-%m-%d").to_string())
        .with("value", value)
}

/// Config for one source named `stats` over `entities`. `extra` is spliced
/// into the `[[sources]]` table before its sub-tables.
pub fn batch_config(entities: &[&str], extra: &str) -> SourceConfig {
    config_with("static", entities, extra, "")
}

pub fn config_with(kind: &str, entities: &[&str], extra: &str, tables: &str) -> SourceConfig {
    let catalog: String = entities
        .iter()
        .map(|e| format!("\n[[sources.catalog.entities]]\nentity = \"{e}\"\n"))
        .collect();
    let text = format!(
        r#"
database = "unused.db"

[[sources]]
id = "stats"
kind = "{kind}"
{extra}

[sources.mapping]
point_field = "date"
point_kind = "date"
value_fields = ["value"]
{tables}
{catalog}
"#
    );
    FreshlineConfig::from_toml(&text)
        .expect("fixture config parses")
        .sources
        .remove(0)
}

// ── Batch upstream ───────────────────────────────────────────────────

#[derive(Default)]
pub struct SeriesUpstream {
    pub series: Mutex<BTreeMap<String, Vec<(NaiveDate, f64)>>>,
    pub failing: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<(Vec<EntityId>, Option<SyncPoint>)>>,
    pub unavailable: Mutex<bool>,
}

impl SeriesUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set `entity`'s value on every day in `days`.
    pub fn publish(&self, entity: &str, days: impl IntoIterator<Item = i64>, value: f64) {
        let mut series = self.series.lock().unwrap();
        let points = series.entry(entity.to_string()).or_default();
        for n in days {
            let date = day(n);
            points.retain(|(d, _)| *d != date);
            points.push((date, value));
        }
        points.sort_by_key(|(d, _)| *d);
    }

    pub fn fail(&self, entity: &str) {
        self.failing.lock().unwrap().insert(entity.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_since(&self) -> Option<SyncPoint> {
        self.calls.lock().unwrap().last().and_then(|(_, since)| *since)
    }
}

pub struct SharedSeries(pub Arc<SeriesUpstream>);

impl Fetcher for SharedSeries {
    fn name(&self) -> &str {
        "scripted-series"
    }

    fn fetch(
        &self,
        entity_ids: &[EntityId],
        _category: &Category,
        since: Option<SyncPoint>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let upstream = &self.0;
        upstream
            .calls
            .lock()
            .unwrap()
            .push((entity_ids.to_vec(), since));

        let failing = upstream.failing.lock().unwrap();
        if entity_ids.iter().any(|id| failing.contains(id.as_str())) {
            return Err(FetchError::Transient("connection reset".into()));
        }

        let after = since.and_then(|p| p.as_date());
        let series = upstream.series.lock().unwrap();
        let mut records = Vec::new();
        for id in entity_ids {
            for (date, value) in series.get(id.as_str()).into_iter().flatten() {
                if after.map_or(true, |a| *date > a) {
                    records.push(record(id.as_str(), *date, *value));
                }
            }
        }
        Ok(records)
    }

    fn is_available(&self) -> bool {
        !*self.0.unavailable.lock().unwrap()
    }
}

pub fn batch_handle(config: &SourceConfig, upstream: &Arc<SeriesUpstream>) -> SourceHandle {
    SourceHandle::new(
        config.clone(),
        Upstream::Batch(Box::new(SharedSeries(Arc::clone(upstream)))),
        load_catalog(config),
    )
}

// ── Date-point upstream ──────────────────────────────────────────────

#[derive(Default)]
pub struct DailyUpstream {
    pub days: Mutex<BTreeMap<NaiveDate, Vec<(String, f64)>>>,
    pub calls: Mutex<Vec<NaiveDate>>,
}

impl DailyUpstream {
    /// Every entity published on every date in `[first, last]`.
    pub fn covering(entities: &[&str], first: NaiveDate, last: NaiveDate) -> Arc<Self> {
        let upstream = Self::default();
        {
            let mut days = upstream.days.lock().unwrap();
            for date in first.iter_days().take_while(|d| *d <= last) {
                let rows = entities
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.to_string(), i as f64 + 1.0))
                    .collect();
                days.insert(date, rows);
            }
        }
        Arc::new(upstream)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub struct SharedDaily(pub Arc<DailyUpstream>);

impl PointFetcher for SharedDaily {
    fn name(&self) -> &str {
        "scripted-daily"
    }

    fn fetch_point(&self, _category: &Category, date: NaiveDate) -> Result<Vec<RawRecord>, FetchError> {
        self.0.calls.lock().unwrap().push(date);
        let days = self.0.days.lock().unwrap();
        Ok(days
            .get(&date)
            .into_iter()
            .flatten()
            .map(|(entity, value)| record(entity, date, *value))
            .collect())
    }
}

pub fn daily_handle(config: &SourceConfig, upstream: &Arc<DailyUpstream>) -> SourceHandle {
    SourceHandle::new(
        config.clone(),
        Upstream::Points(Box::new(SharedDaily(Arc::clone(upstream)))),
        load_catalog(config),
    )
}
