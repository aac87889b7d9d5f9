//! The generic collector.
//!
//! One control flow serves every source: the source contributes a fetcher,
//! a record mapper, field policies and its categories; the collector plans
//! batches against the day's remaining quota, throttles, and hands each
//! (entity, category) pair to the unit-of-work executor.
//!
//! Date-point sources (one request per date for all entities) are collected
//! through the two-phase backfill instead of entity batches.

use crate::backfill::{EntityScope, StoreGapSource};
use crate::budget::RequestBudget;
use crate::config::SourceConfig;
use crate::sources::{SourceHandle, Upstream};
use crate::summary::{RunKind, RunSummary};
use chrono::{Duration, NaiveDate, Utc};
use freshline_core::data::{Fetcher, PointFetcher};
use freshline_core::domain::{
    Category, EntityId, NaiveDateRange, RawRecord, SyncMode, SyncPoint, TrackingKey,
};
use freshline_core::error::{FatalError, FetchError};
use freshline_core::executor::{FailureKind, UnitExecutor, UnitOfWorkResult, UnitRequest};
use freshline_core::gap::{days_before, Backfill, BackfillConfig};
use freshline_core::planner::{plan, Throttle};
use freshline_core::store::SyncStore;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Caller-supplied narrowing of a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Refill from the configured earliest point instead of resuming.
    pub force: bool,
    /// Explicit date range; records outside it are dropped.
    pub range: Option<NaiveDateRange>,
    /// Entity id prefix.
    pub filter: Option<String>,
    /// Maximum number of entities.
    pub limit: Option<usize>,
    /// Overrides the source's backfill knobs.
    pub backfill: Option<BackfillConfig>,
}

impl RunOptions {
    pub fn incremental() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> SyncMode {
        SyncMode::from_force(self.force)
    }
}

/// Apply the filter and limit of `opts`, keeping order.
pub fn narrow(ids: impl IntoIterator<Item = EntityId>, opts: &RunOptions) -> Vec<EntityId> {
    let ids = ids.into_iter().filter(|id| {
        opts.filter
            .as_deref()
            .map_or(true, |prefix| id.as_str().starts_with(prefix))
    });
    match opts.limit {
        Some(n) => ids.take(n).collect(),
        None => ids.collect(),
    }
}

pub(crate) fn throttle_for(config: &SourceConfig) -> Throttle {
    config
        .throttle
        .map(Throttle::new)
        .unwrap_or_else(Throttle::unlimited)
}

pub struct Collector<'h, 's> {
    handle: &'h SourceHandle,
    store: &'s mut SyncStore,
    lease_ttl: Option<Duration>,
}

impl<'h, 's> Collector<'h, 's> {
    pub fn new(handle: &'h SourceHandle, store: &'s mut SyncStore) -> Self {
        Self {
            handle,
            store,
            lease_ttl: None,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn collect(&mut self, opts: &RunOptions) -> Result<RunSummary, FatalError> {
        self.run(RunKind::Collect, opts)
    }

    /// Gap detection and two-phase backfill. Only date-point sources have a
    /// calendar to scan.
    pub fn backfill(&mut self, opts: &RunOptions) -> Result<RunSummary, FatalError> {
        if let Upstream::Batch(_) = self.handle.upstream {
            return Err(FatalError::Config(format!(
                "source '{}' has no date-point upstream to backfill",
                self.handle.config.id
            )));
        }
        self.run(RunKind::Backfill, opts)
    }

    pub fn run(&mut self, kind: RunKind, opts: &RunOptions) -> Result<RunSummary, FatalError> {
        let handle = self.handle;
        let config = &handle.config;
        let mut summary = RunSummary::new(config.id.clone(), kind, opts.mode(), Utc::now());
        info!(
            source = %config.id,
            run_id = %summary.run_id,
            upstream = handle.upstream.name(),
            mode = opts.mode().as_str(),
            ?kind,
            "run started"
        );

        match &handle.upstream {
            Upstream::Batch(fetcher) => self.collect_batches(fetcher.as_ref(), opts, &mut summary)?,
            Upstream::Points(fetcher) => self.collect_points(fetcher.as_ref(), opts, &mut summary)?,
        }

        info!(
            source = %config.id,
            run_id = %summary.run_id,
            succeeded = summary.tally.succeeded,
            partial = summary.tally.partial,
            failed = summary.tally.failed,
            skipped = summary.tally.skipped,
            deferred = summary.tally.deferred,
            requests = summary.requests_used,
            "run finished"
        );
        Ok(summary)
    }

    fn entity_ids(&self) -> Result<Vec<EntityId>, FatalError> {
        self.handle
            .catalog
            .entity_ids()
            .map_err(|e| FatalError::Config(e.to_string()))
    }

    fn executor(&mut self, run_id: &str) -> UnitExecutor<'_> {
        let handle = self.handle;
        let config = &handle.config;
        let executor = UnitExecutor::new(
            &mut *self.store,
            config.id.clone(),
            run_id,
            &config.mapping,
            &config.sanitize,
        );
        match self.lease_ttl {
            Some(ttl) => executor.with_lease_ttl(ttl),
            None => executor,
        }
    }

    fn collect_batches(
        &mut self,
        fetcher: &dyn Fetcher,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<(), FatalError> {
        let handle = self.handle;
        let config = &handle.config;
        let entities = narrow(self.entity_ids()?, opts);
        let mut budget = RequestBudget::new(config.id.clone(), config.daily_quota);
        let mut throttle = throttle_for(config);
        let run_id = summary.run_id.clone();
        let mut executor = self.executor(&run_id);
        let request = UnitRequest {
            mode: opts.mode(),
            window: opts.range,
        };

        for category in &config.categories {
            let remaining = budget.remaining(executor.store())?;
            let plan = plan(&entities, config.batch_size, remaining);
            let mut deferred = plan.deferred.clone();

            for (i, batch) in plan.batches.iter().enumerate() {
                let since = batch_since(executor.store(), config, category, &batch.entities, opts)?;
                let cost = fetcher.request_cost(since).max(1);
                if !budget.reserve(executor.store(), cost)? {
                    let rest = plan.batches[i..].iter().flat_map(|b| b.entities.iter().cloned());
                    deferred.splice(0..0, rest);
                    break;
                }

                if !fetcher.is_available() {
                    budget.refund(executor.store(), cost)?;
                    warn!(source = %config.id, batch = batch.index, "circuit open, batch not sent");
                    for entity in &batch.entities {
                        let key = TrackingKey {
                            entity: entity.clone(),
                            category: category.clone(),
                        };
                        let result = UnitOfWorkResult::failed(
                            &key,
                            FailureKind::CircuitOpen,
                            FetchError::CircuitOpen.to_string(),
                        );
                        executor.note(&result);
                        summary.units.push(result);
                    }
                    continue;
                }

                throttle.wait();
                debug!(
                    source = %config.id,
                    %category,
                    batch = batch.index,
                    entities = batch.entities.len(),
                    ?since,
                    "fetching batch"
                );
                let mut fetched = fetcher
                    .fetch(&batch.entities, category, since)
                    .map(group_by_entity);

                for entity in &batch.entities {
                    let key = TrackingKey {
                        entity: entity.clone(),
                        category: category.clone(),
                    };
                    let records = match &mut fetched {
                        Ok(groups) => Ok(groups.remove(entity).unwrap_or_default()),
                        Err(e) => Err(e.clone()),
                    };
                    let result = executor.execute_upsert(&key, request, move || records)?;
                    summary.units.push(result);
                }
                if let Ok(groups) = &fetched {
                    if !groups.is_empty() {
                        debug!(
                            source = %config.id,
                            unrequested = groups.len(),
                            "ignoring records for entities outside the batch"
                        );
                    }
                }
            }

            if !deferred.is_empty() {
                summary.quota_exhausted = true;
                info!(
                    source = %config.id,
                    %category,
                    deferred = deferred.len(),
                    "daily quota reached, deferring remaining entities"
                );
            }
            for entity in deferred {
                executor.defer();
                if !summary.deferred.contains(&entity) {
                    summary.deferred.push(entity);
                }
            }
        }

        summary.requests_used = budget.used();
        summary.finish(executor.into_tally());
        Ok(())
    }

    fn collect_points(
        &mut self,
        fetcher: &dyn PointFetcher,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<(), FatalError> {
        let handle = self.handle;
        let config = &handle.config;
        let today = summary.started_at.date_naive();
        let calendar = config.backfill.calendar();
        let limits = opts.backfill.unwrap_or_else(|| config.backfill.limits());
        let catalog = self.entity_ids()?;
        let mut budget = RequestBudget::new(config.id.clone(), config.daily_quota);
        let mut throttle = throttle_for(config);
        let run_id = summary.run_id.clone();
        let mut executor = self.executor(&run_id);

        for category in &config.categories {
            let mut gaps = StoreGapSource::new(
                &mut executor,
                fetcher,
                category.clone(),
                calendar.clone(),
                today,
                opts.mode(),
                &mut budget,
                &mut throttle,
                EntityScope::new(catalog.clone(), opts),
            );
            let report = match (opts.range, opts.force) {
                (Some(range), _) => gaps.fill_range(range)?,
                (None, true) => gaps.fill_range(force_range(config, today, limits))?,
                (None, false) => Backfill::new(limits, calendar.clone(), today).run(&mut gaps)?,
            };
            summary.units.extend(gaps.into_units());
            summary.quota_exhausted |= report.quota_exhausted;
            summary.backfill.insert(category.clone(), report);
        }

        summary.requests_used = budget.used();
        summary.finish(executor.into_tally());
        Ok(())
    }
}

/// Full-history range of a forced date-point run.
fn force_range(config: &SourceConfig, today: NaiveDate, limits: BackfillConfig) -> NaiveDateRange {
    let start = config
        .earliest
        .unwrap_or_else(|| days_before(today, limits.max_days));
    NaiveDateRange::new(start, today)
}

/// Point a batch resumes from: the oldest tracked point of its entities,
/// `None` (full history) when any entity has never been synced.
fn batch_since(
    store: &SyncStore,
    config: &SourceConfig,
    category: &Category,
    entities: &[EntityId],
    opts: &RunOptions,
) -> Result<Option<SyncPoint>, FatalError> {
    if let Some(range) = opts.range {
        return Ok(range.start.pred_opt().map(SyncPoint::Date));
    }
    if opts.force {
        return Ok(config
            .earliest
            .and_then(|d| d.pred_opt())
            .map(SyncPoint::Date));
    }

    let mut since: Option<SyncPoint> = None;
    for entity in entities {
        let key = TrackingKey {
            entity: entity.clone(),
            category: category.clone(),
        };
        match store.get_sync_point(&config.id, &key)? {
            None => return Ok(None),
            Some(point) => since = Some(since.map_or(point, |s| s.min(point))),
        }
    }
    Ok(since)
}

fn group_by_entity(records: Vec<RawRecord>) -> BTreeMap<EntityId, Vec<RawRecord>> {
    let mut groups: BTreeMap<EntityId, Vec<RawRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.entity.clone()).or_default().push(record);
    }
    groups
}
