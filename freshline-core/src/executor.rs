//! Unit-of-Work executor.
//!
//! One unit = fetch, map, sanitize and persist the records of a single
//! (entity, category) pair. Persistence and the tracking update share one
//! transaction, so a failing unit leaves no rows behind. Only fatal fetch
//! errors escape; everything else becomes a [`UnitOfWorkResult`].

use crate::domain::{NaiveDateRange, Observation, RawRecord, SourceId, SyncMode, SyncPoint, TrackingKey};
use crate::error::{FatalError, FetchError, StoreError};
use crate::mapper::RecordMapper;
use crate::sanitize::FieldPolicies;
use crate::store::{RecordOutcome, SyncStore, UnitTx};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Lease held on a key while its unit runs.
pub const DEFAULT_LEASE_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    /// Some records were unusable; the rest were committed.
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    RateLimited,
    CircuitOpen,
    DataShape,
    PersistenceConflict,
    Unsupported,
    LeaseHeld,
    QuotaExceeded,
}

impl FailureKind {
    pub fn from_fetch(err: &FetchError) -> Self {
        match err {
            FetchError::Transient(_) | FetchError::Fatal(_) => FailureKind::Transient,
            FetchError::RateLimited { .. } => FailureKind::RateLimited,
            FetchError::CircuitOpen => FailureKind::CircuitOpen,
            FetchError::DataShape(_) => FailureKind::DataShape,
            FetchError::Unsupported(_) => FailureKind::Unsupported,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::DataShape => "data_shape",
            FailureKind::PersistenceConflict => "persistence_conflict",
            FailureKind::Unsupported => "unsupported",
            FailureKind::LeaseHeld => "lease_held",
            FailureKind::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// What a unit is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRequest {
    pub mode: SyncMode,
    /// Records with a dated point outside this window are dropped.
    pub window: Option<NaiveDateRange>,
}

impl UnitRequest {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode, window: None }
    }

    pub fn within(mut self, window: NaiveDateRange) -> Self {
        self.window = Some(window);
        self
    }

    fn admits(&self, point: &SyncPoint) -> bool {
        match (self.window, point.as_date()) {
            (Some(w), Some(d)) => w.contains(d),
            _ => true,
        }
    }
}

/// Outcome of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWorkResult {
    pub key: TrackingKey,
    pub status: UnitStatus,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    /// Raw records returned by the fetcher.
    pub fetched: usize,
    /// Rows inserted or changed.
    pub rows_written: usize,
    pub skipped_records: usize,
    pub clamped_values: usize,
    /// Highest point persisted by this unit.
    pub point: Option<SyncPoint>,
    pub tracking: Option<RecordOutcome>,
    /// Newest persisted observation, used to refresh sentinel baselines.
    #[serde(skip)]
    pub latest: Option<Observation>,
}

impl UnitOfWorkResult {
    fn empty(key: &TrackingKey, status: UnitStatus) -> Self {
        Self {
            key: key.clone(),
            status,
            failure: None,
            error: None,
            fetched: 0,
            rows_written: 0,
            skipped_records: 0,
            clamped_values: 0,
            point: None,
            tracking: None,
            latest: None,
        }
    }

    pub fn failed(key: &TrackingKey, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            failure: Some(kind),
            error: Some(error.into()),
            ..Self::empty(key, UnitStatus::Failed)
        }
    }

    pub fn skipped(key: &TrackingKey, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(kind),
            error: Some(reason.into()),
            ..Self::empty(key, UnitStatus::Skipped)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, UnitStatus::Success | UnitStatus::Partial)
    }
}

/// Running counts over many units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTally {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entities never attempted because the quota ran out.
    pub deferred: usize,
    pub rows_written: usize,
    pub skipped_records: usize,
    pub clamped_values: usize,
}

impl UnitTally {
    pub fn record(&mut self, result: &UnitOfWorkResult) {
        match result.status {
            UnitStatus::Success => self.succeeded += 1,
            UnitStatus::Partial => self.partial += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::Skipped => self.skipped += 1,
        }
        self.rows_written += result.rows_written;
        self.skipped_records += result.skipped_records;
        self.clamped_values += result.clamped_values;
    }

    pub fn merge(&mut self, other: &UnitTally) {
        self.succeeded += other.succeeded;
        self.partial += other.partial;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
        self.rows_written += other.rows_written;
        self.skipped_records += other.skipped_records;
        self.clamped_values += other.clamped_values;
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.partial + self.failed + self.skipped
    }

    /// Every entity was attempted and committed. Partial units count: they
    /// committed every well-formed record and only skipped malformed ones.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.deferred == 0
    }
}

/// Proof that a full sync of a source completed. The only way to lower a
/// source's freshness flag.
#[derive(Debug)]
pub struct FullSyncReceipt {
    source: SourceId,
}

impl FullSyncReceipt {
    pub fn from_tally(source: SourceId, tally: &UnitTally) -> Option<Self> {
        tally.is_complete().then_some(Self { source })
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }
}

/// Runs units of work for one source against one store.
pub struct UnitExecutor<'a> {
    store: &'a mut SyncStore,
    source: SourceId,
    run_id: String,
    mapper: &'a RecordMapper,
    policies: &'a FieldPolicies,
    lease_ttl: Duration,
    tally: UnitTally,
}

impl<'a> UnitExecutor<'a> {
    pub fn new(
        store: &'a mut SyncStore,
        source: SourceId,
        run_id: impl Into<String>,
        mapper: &'a RecordMapper,
        policies: &'a FieldPolicies,
    ) -> Self {
        Self {
            store,
            source,
            run_id: run_id.into(),
            mapper,
            policies,
            lease_ttl: Duration::minutes(DEFAULT_LEASE_TTL_MINUTES),
            tally: UnitTally::default(),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn store(&mut self) -> &mut SyncStore {
        &mut *self.store
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tally(&self) -> &UnitTally {
        &self.tally
    }

    pub fn into_tally(self) -> UnitTally {
        self.tally
    }

    /// Count an entity the planner could not fit into the quota.
    pub fn defer(&mut self) {
        self.tally.deferred += 1;
    }

    /// Record a unit that never reached `execute` (e.g. its batch request
    /// was refused before sending).
    pub fn note(&mut self, result: &UnitOfWorkResult) {
        self.tally.record(result);
    }

    /// Execute with the default persister: idempotent observation upsert.
    pub fn execute_upsert<F>(
        &mut self,
        key: &TrackingKey,
        request: UnitRequest,
        fetch: F,
    ) -> Result<UnitOfWorkResult, FatalError>
    where
        F: FnOnce() -> Result<Vec<RawRecord>, FetchError>,
    {
        self.execute(key, request, fetch, |tx, records| {
            tx.upsert_observations(records)
        })
    }

    pub fn execute<F, P>(
        &mut self,
        key: &TrackingKey,
        request: UnitRequest,
        fetch: F,
        persist: P,
    ) -> Result<UnitOfWorkResult, FatalError>
    where
        F: FnOnce() -> Result<Vec<RawRecord>, FetchError>,
        P: FnOnce(&UnitTx<'_>, &[Observation]) -> Result<usize, StoreError>,
    {
        let acquired = self.store.acquire_lease(
            &self.source,
            key,
            &self.run_id,
            self.lease_ttl,
            Utc::now(),
        )?;
        if !acquired {
            info!(source = %self.source, %key, "unit skipped: key leased by another run");
            let result =
                UnitOfWorkResult::skipped(key, FailureKind::LeaseHeld, "key leased by another run");
            self.finish(key, request.mode, &result);
            return Ok(result);
        }

        let result = self.run_leased(key, request, fetch, persist);

        if let Err(e) = self.store.release_lease(&self.source, key, &self.run_id) {
            warn!(source = %self.source, %key, error = %e, "failed to release lease");
        }

        let result = result?;
        self.finish(key, request.mode, &result);
        Ok(result)
    }

    fn run_leased<F, P>(
        &mut self,
        key: &TrackingKey,
        request: UnitRequest,
        fetch: F,
        persist: P,
    ) -> Result<UnitOfWorkResult, FatalError>
    where
        F: FnOnce() -> Result<Vec<RawRecord>, FetchError>,
        P: FnOnce(&UnitTx<'_>, &[Observation]) -> Result<usize, StoreError>,
    {
        let raw = match fetch() {
            Ok(raw) => raw,
            Err(e) if e.is_fatal() => {
                return Err(FatalError::Fetch {
                    provider: self.source.to_string(),
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                warn!(source = %self.source, %key, error = %e, "fetch failed");
                return Ok(UnitOfWorkResult::failed(
                    key,
                    FailureKind::from_fetch(&e),
                    e.to_string(),
                ));
            }
        };

        let fetched = raw.len();
        let mut skipped_records = 0;
        let mut clamped_values = 0;
        let mut observations = Vec::with_capacity(fetched);
        for record in &raw {
            match self.mapper.map(record, &key.category) {
                Ok(mut obs) => {
                    if !request.admits(&obs.point) {
                        continue;
                    }
                    clamped_values += self.policies.apply(&mut obs);
                    observations.push(obs);
                }
                Err(e) => {
                    debug!(source = %self.source, %key, error = %e, "record skipped");
                    skipped_records += 1;
                }
            }
        }

        if observations.is_empty() && skipped_records > 0 {
            return Ok(UnitOfWorkResult {
                fetched,
                skipped_records,
                ..UnitOfWorkResult::failed(
                    key,
                    FailureKind::DataShape,
                    format!("all {skipped_records} records had an unexpected shape"),
                )
            });
        }

        let latest = observations.iter().max_by_key(|o| o.point).cloned();
        let point = latest.as_ref().map(|o| o.point);

        match self.commit_unit(key, request.mode, point, &observations, persist) {
            Ok((rows_written, tracking)) => Ok(UnitOfWorkResult {
                key: key.clone(),
                status: if skipped_records > 0 {
                    UnitStatus::Partial
                } else {
                    UnitStatus::Success
                },
                failure: (skipped_records > 0).then_some(FailureKind::DataShape),
                error: None,
                fetched,
                rows_written,
                skipped_records,
                clamped_values,
                point,
                tracking,
                latest,
            }),
            Err(e) => {
                warn!(source = %self.source, %key, error = %e, "unit rolled back");
                Ok(UnitOfWorkResult {
                    fetched,
                    skipped_records,
                    ..UnitOfWorkResult::failed(key, FailureKind::PersistenceConflict, e.to_string())
                })
            }
        }
    }

    /// Persist, advance tracking and write the audit row in one transaction.
    fn commit_unit<P>(
        &mut self,
        key: &TrackingKey,
        mode: SyncMode,
        point: Option<SyncPoint>,
        observations: &[Observation],
        persist: P,
    ) -> Result<(usize, Option<RecordOutcome>), StoreError>
    where
        P: FnOnce(&UnitTx<'_>, &[Observation]) -> Result<usize, StoreError>,
    {
        let tx = self.store.unit(&self.source)?;
        let rows = persist(&tx, observations)?;
        let tracking = match point {
            Some(p) => Some(tx.record_result(key, p, mode)?),
            None => None,
        };
        let outcome = tracking.map(|t| t.as_str()).unwrap_or("no_data");
        tx.append_history(key, point, mode, outcome, &self.run_id)?;
        tx.commit()?;
        Ok((rows, tracking))
    }

    fn finish(&mut self, key: &TrackingKey, mode: SyncMode, result: &UnitOfWorkResult) {
        self.tally.record(result);
        if result.is_success() {
            debug!(
                source = %self.source,
                %key,
                rows = result.rows_written,
                point = ?result.point,
                "unit committed"
            );
            return;
        }
        let outcome = result.failure.map(FailureKind::as_str).unwrap_or("failed");
        if let Err(e) = self
            .store
            .append_history(&self.source, key, mode, outcome, &self.run_id)
        {
            warn!(source = %self.source, %key, error = %e, "failed to append sync history");
        }
    }
}
