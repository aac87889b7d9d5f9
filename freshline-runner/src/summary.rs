//! Run summaries and the JSONL run log.
//!
//! Every collect, backfill or update run ends with a [`RunSummary`]: unit
//! counts, per-unit outcomes with reasons, deferred entities and quota use.
//! Summaries are appended to the run log one JSON object per line, so a
//! partial write never corrupts earlier runs.

use chrono::{DateTime, Utc};
use freshline_core::domain::{Category, EntityId, SourceId, SyncMode};
use freshline_core::executor::{FullSyncReceipt, UnitOfWorkResult, UnitStatus, UnitTally};
use freshline_core::gap::BackfillReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Collect,
    Backfill,
    Update,
}

/// Outcome of one run over one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source: SourceId,
    pub kind: RunKind,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tally: UnitTally,
    pub units: Vec<UnitOfWorkResult>,
    /// Entities the quota could not cover; the next run resumes them.
    pub deferred: Vec<EntityId>,
    pub requests_used: u32,
    pub quota_exhausted: bool,
    /// Per-category gap reports of date-point sources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backfill: BTreeMap<Category, BackfillReport>,
}

/// Run id: BLAKE3 of source, mode and start time, first 16 hex chars.
pub fn run_id(source: &SourceId, kind: RunKind, mode: SyncMode, started_at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(format!("{kind:?}").as_bytes());
    hasher.update(mode.as_str().as_bytes());
    hasher.update(started_at.to_rfc3339().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

impl RunSummary {
    pub fn new(source: SourceId, kind: RunKind, mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id(&source, kind, mode, started_at),
            source,
            kind,
            mode,
            started_at,
            finished_at: None,
            tally: UnitTally::default(),
            units: Vec::new(),
            deferred: Vec::new(),
            requests_used: 0,
            quota_exhausted: false,
            backfill: BTreeMap::new(),
        }
    }

    pub fn finish(&mut self, tally: UnitTally) {
        self.tally = tally;
        self.finished_at = Some(Utc::now());
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOfWorkResult> {
        self.units
            .iter()
            .filter(|u| matches!(u.status, UnitStatus::Failed | UnitStatus::Skipped))
    }

    /// Receipt for lowering the freshness flag, when nothing failed, was
    /// skipped or deferred and every gap report left no dates behind.
    pub fn receipt(&self) -> Option<FullSyncReceipt> {
        if self.quota_exhausted {
            return None;
        }
        let gaps_left = self
            .backfill
            .values()
            .any(|r| r.deferred > 0 || !r.failed.is_empty() || !r.forward_failed.is_empty());
        if gaps_left {
            return None;
        }
        FullSyncReceipt::from_tally(self.source.clone(), &self.tally)
    }

    /// One-line human summary for CLI output.
    pub fn headline(&self) -> String {
        format!(
            "{} [{}] {}: {} ok, {} partial, {} failed, {} skipped, {} deferred; {} rows, {} clamped, {} requests{}",
            self.source,
            self.run_id,
            self.mode.as_str(),
            self.tally.succeeded,
            self.tally.partial,
            self.tally.failed,
            self.tally.skipped,
            self.tally.deferred,
            self.tally.rows_written,
            self.tally.clamped_values,
            self.requests_used,
            if self.quota_exhausted {
                " (quota exhausted)"
            } else {
                ""
            }
        )
    }
}

/// Append-only JSONL log of run summaries.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, summary: &RunSummary) -> io::Result<()> {
        let json = serde_json::to_string(summary)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // One write per line so parallel runs never interleave.
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{json}\n").as_bytes())?;
        file.flush()
    }

    /// All summaries in the log. Malformed lines are skipped.
    pub fn read_all(&self) -> io::Result<Vec<RunSummary>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = io::BufReader::new(fs::File::open(&self.path)?);
        let mut summaries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunSummary>(&line) {
                Ok(summary) => summaries.push(summary),
                Err(e) => debug!(error = %e, "skipping malformed run log line"),
            }
        }
        Ok(summaries)
    }

    /// Most recent summary for `source`.
    pub fn last_for(&self, source: &SourceId) -> io::Result<Option<RunSummary>> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|s| &s.source == source))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
