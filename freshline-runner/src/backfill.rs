//! Backfill wiring for date-point sources.
//!
//! [`StoreGapSource`] answers the gap detector's questions from the store and
//! a [`PointFetcher`], spending the daily request budget one date at a time.
//! Each fetched date fans out into one unit of work per entity.

use crate::budget::RequestBudget;
use crate::collector::{narrow, RunOptions};
use chrono::NaiveDate;
use freshline_core::data::PointFetcher;
use freshline_core::domain::{
    Category, EntityId, NaiveDateRange, RawRecord, SyncMode, TrackingKey,
};
use freshline_core::error::{FatalError, FetchError};
use freshline_core::executor::{UnitExecutor, UnitOfWorkResult, UnitRequest};
use freshline_core::gap::{BackfillReport, FillOutcome, GapSource, TradingCalendar};
use freshline_core::planner::Throttle;
use freshline_core::store::SyncStore;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Expected dates walked back while looking for the newest published one.
pub const PROBE_DAYS: usize = 5;

/// Newest expected date on or before `today` that upstream has data for,
/// with that date's records. Each probe spends one request.
pub fn probe_latest(
    fetcher: &dyn PointFetcher,
    category: &Category,
    calendar: &TradingCalendar,
    today: NaiveDate,
    store: &mut SyncStore,
    budget: &mut RequestBudget,
    throttle: &mut Throttle,
) -> Result<Option<(NaiveDate, Vec<RawRecord>)>, FetchError> {
    let mut day = calendar.latest_expected_on_or_before(today);
    for _ in 0..PROBE_DAYS {
        let Some(date) = day else { break };
        let granted = budget
            .reserve(store, 1)
            .map_err(|e| FetchError::Fatal(format!("quota ledger: {e}")))?;
        if !granted {
            return Err(FetchError::RateLimited {
                retry_after_secs: budget.resets_in_secs(),
            });
        }
        throttle.wait();
        let records = fetcher.fetch_point(category, date)?;
        if !records.is_empty() {
            debug!(%date, records = records.len(), "newest published date");
            return Ok(Some((date, records)));
        }
        day = date
            .pred_opt()
            .and_then(|d| calendar.latest_expected_on_or_before(d));
    }
    Ok(None)
}

/// Which entities of a date's response become units.
#[derive(Debug, Clone, Default)]
pub struct EntityScope {
    /// Catalog entities, when the source has a catalog.
    allowed: Option<BTreeSet<EntityId>>,
    filter: Option<String>,
    limit: Option<usize>,
}

impl EntityScope {
    pub fn new(catalog: Vec<EntityId>, opts: &RunOptions) -> Self {
        if catalog.is_empty() {
            return Self {
                allowed: None,
                filter: opts.filter.clone(),
                limit: opts.limit,
            };
        }
        Self {
            allowed: Some(narrow(catalog, opts).into_iter().collect()),
            filter: None,
            limit: None,
        }
    }

    fn select(&self, ids: impl Iterator<Item = EntityId>) -> Vec<EntityId> {
        let ids = ids.filter(|id| self.allowed.as_ref().map_or(true, |a| a.contains(id)));
        let ids = ids.filter(|id| {
            self.filter
                .as_deref()
                .map_or(true, |p| id.as_str().starts_with(p))
        });
        match self.limit {
            Some(n) => ids.take(n).collect(),
            None => ids.collect(),
        }
    }
}

/// Gap source backed by the store and a point fetcher.
pub struct StoreGapSource<'r, 'a> {
    executor: &'r mut UnitExecutor<'a>,
    fetcher: &'r dyn PointFetcher,
    category: Category,
    calendar: TradingCalendar,
    today: NaiveDate,
    mode: SyncMode,
    budget: &'r mut RequestBudget,
    throttle: &'r mut Throttle,
    scope: EntityScope,
    /// Records fetched while probing, reused by the first fill of that date.
    probed: Option<(NaiveDate, Vec<RawRecord>)>,
    /// Newest date upstream has published, once probed.
    horizon: Option<NaiveDate>,
    units: Vec<UnitOfWorkResult>,
}

impl<'r, 'a> StoreGapSource<'r, 'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: &'r mut UnitExecutor<'a>,
        fetcher: &'r dyn PointFetcher,
        category: Category,
        calendar: TradingCalendar,
        today: NaiveDate,
        mode: SyncMode,
        budget: &'r mut RequestBudget,
        throttle: &'r mut Throttle,
        scope: EntityScope,
    ) -> Self {
        Self {
            executor,
            fetcher,
            category,
            calendar,
            today,
            mode,
            budget,
            throttle,
            scope,
            probed: None,
            horizon: None,
            units: Vec::new(),
        }
    }

    pub fn into_units(self) -> Vec<UnitOfWorkResult> {
        self.units
    }

    /// Fill every expected date of `range`, oldest first. Dates already on
    /// file are skipped unless the run is forced.
    pub fn fill_range(&mut self, range: NaiveDateRange) -> Result<BackfillReport, FatalError> {
        let mut report = BackfillReport {
            window: Some(range),
            ..BackfillReport::default()
        };
        let stored = if self.mode == SyncMode::Force {
            BTreeSet::new()
        } else {
            self.stored_points(range)?
        };
        let targets: Vec<NaiveDate> = self
            .calendar
            .expected_in(range)
            .into_iter()
            .filter(|d| !stored.contains(d))
            .collect();
        report.missing_before = targets.len();

        for date in &targets {
            match self.fill(*date)? {
                FillOutcome::Filled { .. } => report.filled.push(*date),
                FillOutcome::Empty => report.empty.push(*date),
                FillOutcome::Failed(reason) => report.failed.push((*date, reason)),
                FillOutcome::QuotaExhausted => {
                    report.quota_exhausted = true;
                    break;
                }
            }
        }
        report.deferred = targets.len() - report.filled.len() - report.empty.len();
        info!(
            source = %self.executor.source(),
            start = %range.start,
            end = %range.end,
            filled = report.filled.len(),
            empty = report.empty.len(),
            deferred = report.deferred,
            "range fill"
        );
        Ok(report)
    }

    fn fetch_date(&mut self, date: NaiveDate) -> Result<Result<Vec<RawRecord>, FillOutcome>, FatalError> {
        if self.probed.as_ref().is_some_and(|(d, _)| *d == date) {
            if let Some((_, records)) = self.probed.take() {
                return Ok(Ok(records));
            }
        }

        if !self.budget.reserve(self.executor.store(), 1)? {
            return Ok(Err(FillOutcome::QuotaExhausted));
        }
        self.throttle.wait();
        match self.fetcher.fetch_point(&self.category, date) {
            Ok(records) => Ok(Ok(records)),
            Err(e) if e.is_fatal() => Err(FatalError::Fetch {
                provider: self.fetcher.name().to_string(),
                detail: e.to_string(),
            }),
            Err(e) => {
                warn!(source = %self.executor.source(), %date, error = %e, "date fetch failed");
                Ok(Err(FillOutcome::Failed(e.to_string())))
            }
        }
    }

    /// One unit per entity in the date's response.
    fn persist_date(&mut self, date: NaiveDate, records: Vec<RawRecord>) -> Result<usize, FatalError> {
        let mut by_entity: BTreeMap<EntityId, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            by_entity.entry(record.entity.clone()).or_default().push(record);
        }

        let request = UnitRequest::new(self.mode).within(NaiveDateRange::new(date, date));
        let mut rows = 0;
        for entity in self.scope.select(by_entity.keys().cloned()) {
            let records = by_entity.remove(&entity).unwrap_or_default();
            let key = TrackingKey {
                entity,
                category: self.category.clone(),
            };
            let result = self
                .executor
                .execute_upsert(&key, request, move || Ok(records))?;
            rows += result.rows_written;
            self.units.push(result);
        }
        Ok(rows)
    }
}

impl GapSource for StoreGapSource<'_, '_> {
    fn latest_on_file(&mut self) -> Result<Option<NaiveDate>, FatalError> {
        let source = self.executor.source().clone();
        Ok(self.executor.store().latest_date(&source, &self.category)?)
    }

    fn latest_available(&mut self) -> Result<Option<NaiveDate>, FetchError> {
        let probed = probe_latest(
            self.fetcher,
            &self.category,
            &self.calendar,
            self.today,
            self.executor.store(),
            self.budget,
            self.throttle,
        )?;
        Ok(probed.map(|(date, records)| {
            self.probed = Some((date, records));
            self.horizon = Some(date);
            date
        }))
    }

    fn stored_points(&mut self, window: NaiveDateRange) -> Result<BTreeSet<NaiveDate>, FatalError> {
        let source = self.executor.source().clone();
        let store = self.executor.store();
        let mut known = store.stored_dates(&source, &self.category, window)?;
        known.extend(store.empty_dates(&source, &self.category, window)?);
        Ok(known)
    }

    fn fill(&mut self, date: NaiveDate) -> Result<FillOutcome, FatalError> {
        let records = match self.fetch_date(date)? {
            Ok(records) => records,
            Err(outcome) => return Ok(outcome),
        };
        if records.is_empty() {
            // Nothing at or past the newest published date is final yet.
            if date >= self.horizon.unwrap_or(self.today) {
                return Ok(FillOutcome::Failed("no data published yet".into()));
            }
            debug!(%date, "no upstream data for date");
            let source = self.executor.source().clone();
            self.executor
                .store()
                .mark_empty_date(&source, &self.category, date)?;
            return Ok(FillOutcome::Empty);
        }
        let rows = self.persist_date(date, records)?;
        Ok(FillOutcome::Filled { rows })
    }
}
