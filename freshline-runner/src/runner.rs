//! Runner: wires configuration, store, sources and the run log together.
//!
//! Entry points used by the CLI:
//! - `collect_source()` / `collect_all()`: incremental or forced collection.
//!   `collect_all()` runs every configured source in parallel, each on its
//!   own store connection.
//! - `backfill_source()`: gap detection and two-phase backfill.
//! - `select_sentinels()`, `check_source()`, `update_source()`: the
//!   freshness cycle.
//! - `source_status()`: read-only report, needs no credentials.

use crate::collector::{Collector, RunOptions};
use crate::config::{FreshlineConfig, SourceConfig};
use crate::freshness::{CheckReport, SelectionReport, SentinelMonitor, UpdateOutcome};
use crate::sources::SourceHandle;
use crate::summary::{RunLog, RunSummary};
use chrono::Utc;
use freshline_core::domain::{FreshnessStatus, SourceId, SyncPoint};
use freshline_core::error::FatalError;
use freshline_core::store::SyncStore;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Read-only view of one source's state.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceId,
    pub freshness: FreshnessStatus,
    pub tracked_keys: usize,
    pub oldest_point: Option<SyncPoint>,
    pub newest_point: Option<SyncPoint>,
    pub observations: u64,
    pub quota_spent_today: u32,
    pub daily_quota: u32,
    pub sentinels: usize,
    pub last_run: Option<RunSummary>,
}

pub struct Runner {
    config: FreshlineConfig,
    log: RunLog,
    /// Sources whose fetcher is supplied by the caller instead of built
    /// from configuration.
    injected: BTreeMap<SourceId, SourceHandle>,
}

impl Runner {
    pub fn new(config: FreshlineConfig) -> Self {
        let log = RunLog::new(config.run_log.clone());
        Self {
            config,
            log,
            injected: BTreeMap::new(),
        }
    }

    /// Use `handle` for its source instead of the configured HTTP upstream.
    pub fn with_source(mut self, handle: SourceHandle) -> Self {
        self.injected.insert(handle.config.id.clone(), handle);
        self
    }

    pub fn config(&self) -> &FreshlineConfig {
        &self.config
    }

    pub fn run_log(&self) -> &RunLog {
        &self.log
    }

    pub fn open_store(&self) -> Result<SyncStore, FatalError> {
        Ok(SyncStore::open(&self.config.database)?)
    }

    fn source_config(&self, id: &str) -> Result<&SourceConfig, FatalError> {
        Ok(self.config.source(id)?)
    }

    /// Call `f` with the source's handle, building it from configuration
    /// unless one was injected.
    fn with_handle<T>(
        &self,
        id: &str,
        f: impl FnOnce(&SourceHandle) -> Result<T, FatalError>,
    ) -> Result<T, FatalError> {
        if let Some(handle) = self.injected.get(&SourceId::new(id)) {
            return f(handle);
        }
        let config = self.source_config(id)?;
        let handle = SourceHandle::from_config(config).map_err(FatalError::from)?;
        f(&handle)
    }

    fn record(&self, summary: &RunSummary) {
        if let Err(e) = self.log.append(summary) {
            warn!(
                path = %self.log.path().display(),
                error = %e,
                "failed to append run log"
            );
        }
    }

    pub fn collect_source(&self, id: &str, opts: &RunOptions) -> Result<RunSummary, FatalError> {
        let mut store = self.open_store()?;
        let summary = self.with_handle(id, |handle| Collector::new(handle, &mut store).collect(opts))?;
        self.record(&summary);
        Ok(summary)
    }

    /// Collect every configured source in parallel. One source's fatal
    /// error does not stop the others.
    pub fn collect_all(&self, opts: &RunOptions) -> Vec<(SourceId, Result<RunSummary, FatalError>)> {
        info!(sources = self.config.sources.len(), "collecting all sources");
        self.config
            .sources
            .par_iter()
            .map(|source| {
                let result = self.collect_source(source.id.as_str(), opts);
                if let Err(e) = &result {
                    warn!(source = %source.id, error = %e, "source aborted");
                }
                (source.id.clone(), result)
            })
            .collect()
    }

    pub fn backfill_source(&self, id: &str, opts: &RunOptions) -> Result<RunSummary, FatalError> {
        let mut store = self.open_store()?;
        let summary = self.with_handle(id, |handle| Collector::new(handle, &mut store).backfill(opts))?;
        self.record(&summary);
        Ok(summary)
    }

    pub fn select_sentinels(&self, id: &str, size: Option<usize>) -> Result<SelectionReport, FatalError> {
        let mut store = self.open_store()?;
        self.with_handle(id, |handle| SentinelMonitor::new(handle, &mut store).select_sentinels(size))
    }

    pub fn check_source(&self, id: &str) -> Result<CheckReport, FatalError> {
        let mut store = self.open_store()?;
        self.with_handle(id, |handle| SentinelMonitor::new(handle, &mut store).check_freshness())
    }

    pub fn update_source(&self, id: &str) -> Result<UpdateOutcome, FatalError> {
        let mut store = self.open_store()?;
        let outcome =
            self.with_handle(id, |handle| SentinelMonitor::new(handle, &mut store).update_if_fresh())?;
        if let UpdateOutcome::Updated { summary, .. } = &outcome {
            self.record(summary);
        }
        Ok(outcome)
    }

    pub fn source_status(&self, id: &str) -> Result<SourceStatus, FatalError> {
        let config = self.source_config(id)?;
        let store = self.open_store()?;
        let source = config.id.clone();
        let records = store.tracking_records(&source)?;
        let last_run = self.log.last_for(&source).unwrap_or_else(|e| {
            warn!(path = %self.log.path().display(), error = %e, "failed to read run log");
            None
        });

        Ok(SourceStatus {
            freshness: store.freshness(&source)?,
            tracked_keys: records.len(),
            oldest_point: records.iter().map(|r| r.last_synced_point).min(),
            newest_point: records.iter().map(|r| r.last_synced_point).max(),
            observations: store.observation_count(&source)?,
            quota_spent_today: store.spent_on(&source, Utc::now().date_naive())?,
            daily_quota: config.daily_quota,
            sentinels: store.sentinels(&source)?.len(),
            last_run,
            source,
        })
    }

    pub fn status_all(&self) -> Result<Vec<SourceStatus>, FatalError> {
        self.config
            .sources
            .iter()
            .map(|s| self.source_status(s.id.as_str()))
            .collect()
    }
}
