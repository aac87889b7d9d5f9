//! Sentinel freshness monitor.
//!
//! Instead of re-checking a whole source, a small fixed sample of its
//! entities is re-fetched with one bounded request and compared against the
//! baselines stored when the sample was chosen. Any difference raises the
//! source's freshness flag; only a completed full sync lowers it again.

use crate::backfill::probe_latest;
use crate::budget::RequestBudget;
use crate::collector::{throttle_for, Collector, RunOptions};
use crate::sources::{SourceHandle, Upstream};
use crate::summary::{RunKind, RunSummary};
use chrono::{Duration, Utc};
use freshline_core::domain::{
    Category, EntityId, FreshnessStatus, Observation, RawRecord, SentinelReading, SentinelRole,
    SentinelSample, SourceId, SyncPoint, TrackingKey,
};
use freshline_core::error::{FatalError, FetchError};
use freshline_core::sentinel::{self, SentinelComposition};
use freshline_core::store::SyncStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

type Readings = BTreeMap<EntityId, SentinelReading>;

/// Outcome of choosing a new sentinel sample.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionReport {
    pub source: SourceId,
    pub selected: usize,
    pub aggregate: usize,
    pub diverse: usize,
    pub random: usize,
    /// Sentinels that came back with a baseline value.
    pub with_baseline: usize,
    /// Set when the baseline fetch failed; nothing was persisted then.
    pub error: Option<String>,
}

/// Outcome of one freshness check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub source: SourceId,
    pub sentinels: usize,
    pub responded: usize,
    pub changed: usize,
    pub status: FreshnessStatus,
    /// Set when the check request failed; the flag is untouched then.
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum UpdateOutcome {
    /// The flag was down; nothing was fetched.
    AlreadyFresh(FreshnessStatus),
    Updated {
        summary: RunSummary,
        /// Whether the run earned a receipt and the flag was lowered.
        cleared: bool,
        baselines_refreshed: usize,
    },
}

pub struct SentinelMonitor<'h, 's> {
    handle: &'h SourceHandle,
    store: &'s mut SyncStore,
}

impl<'h, 's> SentinelMonitor<'h, 's> {
    pub fn new(handle: &'h SourceHandle, store: &'s mut SyncStore) -> Self {
        Self { handle, store }
    }

    fn source(&self) -> &SourceId {
        &self.handle.config.id
    }

    /// Choose and persist a new sample with fresh baselines. `size`
    /// overrides the configured sample size.
    pub fn select_sentinels(&mut self, size: Option<usize>) -> Result<SelectionReport, FatalError> {
        let handle = self.handle;
        let config = &handle.config;
        let entries = handle
            .catalog
            .entries()
            .map_err(|e| FatalError::Config(e.to_string()))?;
        let composition = resize(config.sentinel.composition(), size);
        let chosen = sentinel::select(&config.id, &entries, &composition);

        let mut report = SelectionReport {
            source: config.id.clone(),
            selected: chosen.len(),
            aggregate: count_role(&chosen, SentinelRole::Aggregate),
            diverse: count_role(&chosen, SentinelRole::Diverse),
            random: count_role(&chosen, SentinelRole::Random),
            with_baseline: 0,
            error: None,
        };
        if chosen.is_empty() {
            warn!(source = %config.id, "catalog is empty, no sentinels selected");
            return Ok(report);
        }

        let ids: Vec<EntityId> = chosen.iter().map(|(id, _)| id.clone()).collect();
        let readings = match self.fetch_readings(&ids)? {
            Ok(readings) => readings,
            Err(e) => {
                warn!(source = %config.id, error = %e, "baseline fetch failed, sample not saved");
                report.error = Some(e.to_string());
                return Ok(report);
            }
        };

        let now = Utc::now();
        let samples: Vec<SentinelSample> = chosen
            .into_iter()
            .map(|(entity, role)| SentinelSample {
                source: config.id.clone(),
                baseline: readings
                    .get(&entity)
                    .cloned()
                    .unwrap_or_else(SentinelReading::missing),
                entity,
                role,
                baseline_fetched_at: now,
            })
            .collect();
        report.with_baseline = readings.len();
        self.store.replace_sentinels(&config.id, &samples)?;
        info!(
            source = %config.id,
            selected = report.selected,
            aggregate = report.aggregate,
            diverse = report.diverse,
            random = report.random,
            with_baseline = report.with_baseline,
            "sentinels selected"
        );
        Ok(report)
    }

    /// Re-fetch the sentinels and raise the flag if any of them moved.
    pub fn check_freshness(&mut self) -> Result<CheckReport, FatalError> {
        let source = self.source().clone();
        let samples = self.store.sentinels(&source)?;
        let mut report = CheckReport {
            source: source.clone(),
            sentinels: samples.len(),
            responded: 0,
            changed: 0,
            status: self.store.freshness(&source)?,
            error: None,
        };
        if samples.is_empty() {
            warn!(source = %source, "no sentinels selected, nothing to check");
            return Ok(report);
        }

        let ids: Vec<EntityId> = samples.iter().map(|s| s.entity.clone()).collect();
        let readings = match self.fetch_readings(&ids)? {
            Ok(readings) => readings,
            Err(e) => {
                warn!(source = %source, error = %e, "freshness check failed");
                report.error = Some(e.to_string());
                return Ok(report);
            }
        };

        let tolerance = self.handle.config.sentinel.tolerance();
        let changed = sentinel::count_changes(
            samples.iter().map(|s| (&s.entity, &s.baseline)),
            |entity| readings.get(entity).cloned(),
            &tolerance,
        );
        report.responded = readings.len();
        report.changed = changed;
        report.status = self
            .store
            .record_check(&source, u32::try_from(changed).unwrap_or(u32::MAX), Utc::now())?;
        info!(
            source = %source,
            sentinels = report.sentinels,
            responded = report.responded,
            changed,
            state = report.status.state.as_str(),
            "freshness checked"
        );
        Ok(report)
    }

    /// Run a full collection cycle if the flag is up. A cycle that completes
    /// refreshes the baselines and lowers the flag; any other outcome leaves
    /// it raised for the next attempt.
    pub fn update_if_fresh(&mut self) -> Result<UpdateOutcome, FatalError> {
        let handle = self.handle;
        let source = handle.config.id.clone();
        if !self.store.begin_full_update(&source)? {
            debug!(source = %source, "source is fresh, skipping update");
            return Ok(UpdateOutcome::AlreadyFresh(self.store.freshness(&source)?));
        }

        let opts = RunOptions {
            force: handle.config.full_update_force,
            ..RunOptions::default()
        };
        let run = Collector::new(handle, &mut *self.store).run(RunKind::Update, &opts);
        let summary = match run {
            Ok(summary) => summary,
            Err(e) => {
                self.store.abandon_full_update(&source)?;
                return Err(e);
            }
        };

        let Some(receipt) = summary.receipt() else {
            self.store.abandon_full_update(&source)?;
            info!(source = %source, run_id = %summary.run_id, "update incomplete, flag stays raised");
            return Ok(UpdateOutcome::Updated {
                summary,
                cleared: false,
                baselines_refreshed: 0,
            });
        };

        let readings = self.refreshed_baselines(&summary)?;
        let refreshed = self
            .store
            .refresh_baselines(&source, &readings, Utc::now())?;
        self.store.clear_after_full_sync(receipt)?;
        info!(
            source = %source,
            run_id = %summary.run_id,
            baselines_refreshed = refreshed,
            "update complete, source is fresh"
        );
        Ok(UpdateOutcome::Updated {
            summary,
            cleared: true,
            baselines_refreshed: refreshed,
        })
    }

    /// New baselines after a full sync: the newest observation the run
    /// persisted for each sentinel, else the newest one on file.
    fn refreshed_baselines(
        &self,
        summary: &RunSummary,
    ) -> Result<Vec<(EntityId, SentinelReading)>, FatalError> {
        let config = &self.handle.config;
        let category = config.sentinel_category();
        let sentinels: BTreeSet<EntityId> = self
            .store
            .sentinels(&config.id)?
            .into_iter()
            .map(|s| s.entity)
            .collect();

        let mut newest: BTreeMap<EntityId, Observation> = BTreeMap::new();
        for obs in summary
            .units
            .iter()
            .filter(|u| u.key.category == category && sentinels.contains(&u.key.entity))
            .filter_map(|u| u.latest.as_ref())
        {
            keep_newest(&mut newest, obs.clone());
        }

        let mut readings = Vec::with_capacity(sentinels.len());
        for entity in sentinels {
            let obs = match newest.remove(&entity) {
                Some(obs) => Some(obs),
                None => {
                    let key = TrackingKey {
                        entity: entity.clone(),
                        category: category.clone(),
                    };
                    self.store.latest_observation(&config.id, &key)?
                }
            };
            if let Some(obs) = obs {
                readings.push((entity, SentinelReading::from_observation(&obs, &config.sentinel.field)));
            }
        }
        Ok(readings)
    }

    /// Current readings of `ids` from upstream, one request per `batch_size`
    /// ids (or a short probe for date-point sources). The outer error aborts
    /// the run; the inner one is reported.
    fn fetch_readings(&mut self, ids: &[EntityId]) -> Result<Result<Readings, FetchError>, FatalError> {
        let handle = self.handle;
        let config = &handle.config;
        let category = config.sentinel_category();
        let today = Utc::now().date_naive();
        let mut budget = RequestBudget::new(config.id.clone(), config.daily_quota);
        let mut throttle = throttle_for(config);

        let records = match &handle.upstream {
            Upstream::Batch(fetcher) => {
                let since = today
                    .checked_sub_signed(Duration::days(i64::from(config.sentinel.lookback_days)))
                    .map(SyncPoint::Date);
                let batches: Vec<&[EntityId]> = ids.chunks(config.batch_size.max(1)).collect();
                let cost = fetcher.request_cost(since).max(1) * batches.len() as u32;
                if !budget.reserve(&mut *self.store, cost)? {
                    return Ok(Err(FetchError::RateLimited {
                        retry_after_secs: budget.resets_in_secs(),
                    }));
                }
                if !fetcher.is_available() {
                    budget.refund(&mut *self.store, cost)?;
                    return Ok(Err(FetchError::CircuitOpen));
                }
                let mut records = Vec::new();
                let mut outcome = Ok(());
                for batch in batches {
                    throttle.wait();
                    match fetcher.fetch(batch, &category, since) {
                        Ok(mut fetched) => records.append(&mut fetched),
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                outcome.map(|()| records)
            }
            Upstream::Points(fetcher) => probe_latest(
                fetcher.as_ref(),
                &category,
                &config.backfill.calendar(),
                today,
                &mut *self.store,
                &mut budget,
                &mut throttle,
            )
            .map(|found| found.map(|(_, records)| records).unwrap_or_default()),
        };

        match records {
            Ok(records) => Ok(Ok(self.readings_from(records, ids, &category))),
            Err(e) if e.is_fatal() => Err(FatalError::Fetch {
                provider: handle.upstream.name().to_string(),
                detail: e.to_string(),
            }),
            Err(e) => Ok(Err(e)),
        }
    }

    /// Map and sanitize `records` the way a unit would, keeping the newest
    /// observation of each requested entity.
    fn readings_from(&self, records: Vec<RawRecord>, ids: &[EntityId], category: &Category) -> Readings {
        let config = &self.handle.config;
        let wanted: BTreeSet<&EntityId> = ids.iter().collect();
        let mut newest: BTreeMap<EntityId, Observation> = BTreeMap::new();
        for raw in records.iter().filter(|r| wanted.contains(&r.entity)) {
            match config.mapping.map(raw, category) {
                Ok(mut obs) => {
                    config.sanitize.apply(&mut obs);
                    keep_newest(&mut newest, obs);
                }
                Err(e) => debug!(source = %config.id, error = %e, "unusable sentinel record"),
            }
        }
        newest
            .into_iter()
            .map(|(entity, obs)| {
                let reading = SentinelReading::from_observation(&obs, &config.sentinel.field);
                (entity, reading)
            })
            .collect()
    }
}

fn keep_newest(newest: &mut BTreeMap<EntityId, Observation>, obs: Observation) {
    match newest.get(&obs.entity) {
        Some(current) if current.point >= obs.point => {}
        _ => {
            newest.insert(obs.entity.clone(), obs);
        }
    }
}

fn count_role(chosen: &[(EntityId, SentinelRole)], role: SentinelRole) -> usize {
    chosen.iter().filter(|(_, r)| *r == role).count()
}

/// Shrink the aggregate and diverse quotas to fit a smaller sample.
fn resize(mut composition: SentinelComposition, size: Option<usize>) -> SentinelComposition {
    if let Some(size) = size {
        composition.size = size;
        composition.aggregate = composition.aggregate.min(size);
        composition.diverse = composition.diverse.min(size - composition.aggregate);
    }
    composition
}
