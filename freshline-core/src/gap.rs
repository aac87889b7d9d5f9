//! Gap detection and two-phase backfill.
//!
//! The state machine runs `CurrentCheck -> HistoricalScan -> Done`, or ends
//! in `Failed` on a fatal error:
//!
//! 1. **Current check**: if the newest stored point lags the newest point
//!    upstream, fetch the forward range. The outcome never blocks phase 2.
//! 2. **Historical scan**: enumerate the expected points of the last
//!    `max_days` calendar days, diff against what is stored, and fill up to
//!    `max_fills` of the missing points, most recent first.
//!
//! Points still missing at the end are deferred, never failures. A point
//! upstream answers with no data is reported as empty and counts as resolved:
//! the source remembers it so later scans skip it.

use crate::domain::NaiveDateRange;
use crate::error::{FatalError, FetchError};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Which calendar points are expected to carry upstream data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingCalendar {
    #[serde(default)]
    pub weekdays_only: bool,
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn every_day() -> Self {
        Self::default()
    }

    pub fn weekdays() -> Self {
        Self {
            weekdays_only: true,
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn is_expected(&self, date: NaiveDate) -> bool {
        if self.holidays.contains(&date) {
            return false;
        }
        !(self.weekdays_only && matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
    }

    /// The `max_days` calendar days ending at `end`, inclusive. The start
    /// saturates at the earliest representable date.
    pub fn window(end: NaiveDate, max_days: u32) -> NaiveDateRange {
        NaiveDateRange::new(days_before(end, max_days.max(1) - 1), end)
    }

    /// Expected points within `range`, ascending.
    pub fn expected_in(&self, range: NaiveDateRange) -> Vec<NaiveDate> {
        range
            .start
            .iter_days()
            .take_while(|d| *d <= range.end)
            .filter(|d| self.is_expected(*d))
            .collect()
    }

    /// Newest expected point on or before `date`.
    pub fn latest_expected_on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut day = date;
        for _ in 0..366 {
            if self.is_expected(day) {
                return Some(day);
            }
            day = day.pred_opt()?;
        }
        None
    }
}

/// `date` minus `days`, saturating at [`NaiveDate::MIN`].
pub fn days_before(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Independent knobs: `max_days` bounds the scan window, `max_fills` bounds
/// the number of missing points fetched in phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub max_days: u32,
    pub max_fills: u32,
}

impl BackfillConfig {
    /// Largest accepted scan window, about a century of calendar days.
    pub const MAX_DAYS: u32 = 36_600;
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_days: 30,
            max_fills: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    CurrentCheck,
    HistoricalScan,
    Done,
    Failed,
}

/// Result of fetching one point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Filled { rows: usize },
    /// Upstream had nothing for the point (unlisted holiday).
    Empty,
    Failed(String),
    /// No request budget left; stop filling.
    QuotaExhausted,
}

/// What the backfill needs from a source and its store.
pub trait GapSource {
    fn latest_on_file(&mut self) -> Result<Option<NaiveDate>, FatalError>;

    /// Newest point available upstream.
    fn latest_available(&mut self) -> Result<Option<NaiveDate>, FetchError>;

    /// Points within `window` already on file or known to have no upstream
    /// data.
    fn stored_points(&mut self, window: NaiveDateRange) -> Result<BTreeSet<NaiveDate>, FatalError>;

    /// Fetch and persist one point. An `Empty` outcome must be remembered so
    /// `stored_points` reports the point from then on.
    fn fill(&mut self, date: NaiveDate) -> Result<FillOutcome, FatalError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub forward_filled: Vec<NaiveDate>,
    pub forward_failed: Vec<(NaiveDate, String)>,
    pub window: Option<NaiveDateRange>,
    pub missing_before: usize,
    pub filled: Vec<NaiveDate>,
    pub failed: Vec<(NaiveDate, String)>,
    /// Points upstream answered with no data, in either phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty: Vec<NaiveDate>,
    /// Missing points left for a later run.
    pub deferred: usize,
    pub quota_exhausted: bool,
}

impl BackfillReport {
    pub fn requests(&self) -> usize {
        self.forward_filled.len()
            + self.forward_failed.len()
            + self.filled.len()
            + self.failed.len()
            + self.empty.len()
    }
}

/// Two-phase backfill for one source.
pub struct Backfill {
    config: BackfillConfig,
    calendar: TradingCalendar,
    today: NaiveDate,
    state: BackfillState,
    /// Newest upstream point learned in phase 1.
    horizon: Option<NaiveDate>,
    report: BackfillReport,
}

impl Backfill {
    pub fn new(config: BackfillConfig, calendar: TradingCalendar, today: NaiveDate) -> Self {
        Self {
            config,
            calendar,
            today,
            state: BackfillState::CurrentCheck,
            horizon: None,
            report: BackfillReport::default(),
        }
    }

    pub fn state(&self) -> BackfillState {
        self.state
    }

    pub fn report(&self) -> &BackfillReport {
        &self.report
    }

    /// Run to a terminal state.
    pub fn run(mut self, source: &mut dyn GapSource) -> Result<BackfillReport, FatalError> {
        while !matches!(self.state, BackfillState::Done | BackfillState::Failed) {
            self.step(source)?;
        }
        Ok(self.report)
    }

    /// Advance one phase.
    pub fn step(&mut self, source: &mut dyn GapSource) -> Result<BackfillState, FatalError> {
        let next = match self.state {
            BackfillState::CurrentCheck => self.current_check(source),
            BackfillState::HistoricalScan => self.historical_scan(source),
            terminal => Ok(terminal),
        };
        match next {
            Ok(state) => {
                self.state = state;
                Ok(state)
            }
            Err(e) => {
                self.state = BackfillState::Failed;
                Err(e)
            }
        }
    }

    fn current_check(&mut self, source: &mut dyn GapSource) -> Result<BackfillState, FatalError> {
        let on_file = source.latest_on_file()?;
        let available = match source.latest_available() {
            Ok(available) => available,
            Err(e) if e.is_fatal() => {
                return Err(FatalError::Fetch {
                    provider: "backfill".into(),
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                warn!(error = %e, "could not determine newest upstream point");
                None
            }
        };
        self.horizon = available;

        let Some(available) = available else {
            return Ok(BackfillState::HistoricalScan);
        };
        let forward: Vec<NaiveDate> = match on_file {
            Some(on_file) if on_file >= available => Vec::new(),
            Some(on_file) => match on_file.succ_opt() {
                Some(first) => self
                    .calendar
                    .expected_in(NaiveDateRange::new(first, available)),
                None => Vec::new(),
            },
            None => vec![available],
        };

        info!(
            ?on_file,
            %available,
            behind = forward.len(),
            "current check"
        );
        for date in forward {
            match source.fill(date)? {
                FillOutcome::Filled { .. } => self.report.forward_filled.push(date),
                FillOutcome::Empty => self.report.empty.push(date),
                FillOutcome::Failed(reason) => self.report.forward_failed.push((date, reason)),
                FillOutcome::QuotaExhausted => {
                    self.report.quota_exhausted = true;
                    break;
                }
            }
        }
        Ok(BackfillState::HistoricalScan)
    }

    fn historical_scan(&mut self, source: &mut dyn GapSource) -> Result<BackfillState, FatalError> {
        let end = self
            .horizon
            .or_else(|| self.calendar.latest_expected_on_or_before(self.today))
            .unwrap_or(self.today);
        let window = TradingCalendar::window(end, self.config.max_days);
        self.report.window = Some(window);

        let stored = source.stored_points(window)?;
        let mut missing: Vec<NaiveDate> = self
            .calendar
            .expected_in(window)
            .into_iter()
            .filter(|d| !stored.contains(d))
            .collect();
        missing.reverse();
        self.report.missing_before = missing.len();

        let mut resolved = 0;
        if !self.report.quota_exhausted {
            for date in missing.iter().take(self.config.max_fills as usize) {
                match source.fill(*date)? {
                    FillOutcome::Filled { .. } => {
                        self.report.filled.push(*date);
                        resolved += 1;
                    }
                    FillOutcome::Empty => {
                        self.report.empty.push(*date);
                        resolved += 1;
                    }
                    FillOutcome::Failed(reason) => self.report.failed.push((*date, reason)),
                    FillOutcome::QuotaExhausted => {
                        self.report.quota_exhausted = true;
                        break;
                    }
                }
            }
        }
        self.report.deferred = missing.len() - resolved;

        info!(
            window_start = %window.start,
            window_end = %window.end,
            missing = missing.len(),
            filled = self.report.filled.len(),
            deferred = self.report.deferred,
            "historical scan"
        );
        Ok(BackfillState::Done)
    }
}
