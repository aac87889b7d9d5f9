//! Date-point sources: one request per date covers every entity.
//!
//! Exercises the two-phase backfill against the store, explicit ranges and
//! the daily request budget.

mod common;

use chrono::Duration;
use common::{config_with, daily_handle, today, DailyUpstream};
use freshline_core::domain::{Category, NaiveDateRange, SourceId};
use freshline_core::store::SyncStore;
use freshline_runner::collector::{Collector, RunOptions};

const BACKFILL: &str = "[sources.backfill]\nmax_days = 10\nmax_fills = 3\nweekdays_only = false\n";

fn bars() -> Category {
    Category::new("observations")
}

fn stats() -> SourceId {
    SourceId::new("stats")
}

fn ago(days: i64) -> chrono::NaiveDate {
    today() - Duration::days(days)
}

#[test]
fn backfill_catches_up_then_fills_most_recent_gaps() {
    let config = config_with("static", &[], "", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL", "MSFT"], ago(20), today());
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let summary = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();

    let report = &summary.backfill[&bars()];
    assert_eq!(report.forward_filled, vec![today()]);
    assert_eq!(report.missing_before, 9);
    assert_eq!(report.filled, vec![ago(1), ago(2), ago(3)]);
    assert_eq!(report.deferred, 6);
    // The probe's response is reused for the forward fill.
    assert_eq!(upstream.call_count(), 4);
    assert_eq!(summary.requests_used, 4);
    assert_eq!(summary.tally.succeeded, 8);
    assert!(summary.receipt().is_none());

    let window = NaiveDateRange::new(ago(9), today());
    assert_eq!(store.stored_dates(&stats(), &bars(), window).unwrap().len(), 4);
}

#[test]
fn each_backfill_removes_exactly_max_fills_gaps() {
    let config = config_with("static", &[], "", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL"], ago(20), today());
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();
    let window = NaiveDateRange::new(ago(9), today());

    Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();
    let before = store.stored_dates(&stats(), &bars(), window).unwrap().len();

    let second = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();
    let report = &second.backfill[&bars()];
    assert!(report.forward_filled.is_empty());
    assert_eq!(report.missing_before, 6);
    assert_eq!(report.filled, vec![ago(4), ago(5), ago(6)]);
    assert_eq!(report.deferred, 3);

    let after = store.stored_dates(&stats(), &bars(), window).unwrap().len();
    assert_eq!(after, before + 3);
}

#[test]
fn dates_without_upstream_data_are_remembered() {
    let config = config_with("static", &[], "", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL"], ago(20), today());
    upstream.days.lock().unwrap().remove(&ago(2));
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let first = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();
    let report = &first.backfill[&bars()];
    assert_eq!(report.missing_before, 9);
    assert_eq!(report.filled, vec![ago(1), ago(3)]);
    assert_eq!(report.empty, vec![ago(2)]);
    assert_eq!(report.deferred, 6);

    let second = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();
    let report = &second.backfill[&bars()];
    assert_eq!(report.missing_before, 6);
    assert_eq!(report.filled, vec![ago(4), ago(5), ago(6)]);
    assert!(report.empty.is_empty());

    let asked_for_gap = upstream
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|d| **d == ago(2))
        .count();
    assert_eq!(asked_for_gap, 1);
}

#[test]
fn collect_with_range_fills_every_missing_date() {
    let config = config_with("static", &[], "", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL", "MSFT"], ago(20), today());
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let range = NaiveDateRange::new(ago(15), ago(11));
    let opts = RunOptions {
        range: Some(range),
        ..RunOptions::default()
    };
    let summary = Collector::new(&handle, &mut store).collect(&opts).unwrap();

    let report = &summary.backfill[&bars()];
    assert_eq!(report.filled.len(), 5);
    assert_eq!(report.deferred, 0);
    assert_eq!(summary.tally.succeeded, 10);
    assert_eq!(store.stored_dates(&stats(), &bars(), range).unwrap().len(), 5);

    // Stored dates are skipped on a second pass.
    let again = Collector::new(&handle, &mut store).collect(&opts).unwrap();
    assert_eq!(again.backfill[&bars()].missing_before, 0);
    assert_eq!(again.requests_used, 0);
}

#[test]
fn exhausted_budget_stops_filling_and_defers_the_rest() {
    let config = config_with("static", &[], "daily_quota = 2", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL"], ago(20), today());
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let summary = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap();

    let report = &summary.backfill[&bars()];
    assert!(report.quota_exhausted);
    assert!(summary.quota_exhausted);
    assert_eq!(report.forward_filled, vec![today()]);
    assert_eq!(report.filled, vec![ago(1)]);
    assert_eq!(report.deferred, 8);
    assert_eq!(summary.requests_used, 2);
}

#[test]
fn catalog_limits_which_entities_are_stored() {
    let config = config_with("static", &["AAPL"], "", BACKFILL);
    let upstream = DailyUpstream::covering(&["AAPL", "MSFT"], ago(3), today());
    let handle = daily_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let opts = RunOptions {
        range: Some(NaiveDateRange::new(ago(1), today())),
        ..RunOptions::default()
    };
    let summary = Collector::new(&handle, &mut store).collect(&opts).unwrap();

    assert!(summary.units.iter().all(|u| u.key.entity.as_str() == "AAPL"));
    assert_eq!(summary.units.len(), 2);
}

#[test]
fn batch_sources_cannot_be_backfilled() {
    let config = common::batch_config(&["X"], "");
    let upstream = common::SeriesUpstream::new();
    let handle = common::batch_handle(&config, &upstream);
    let mut store = SyncStore::open_in_memory().unwrap();

    let err = Collector::new(&handle, &mut store)
        .backfill(&RunOptions::incremental())
        .unwrap_err();
    assert!(err.to_string().contains("configuration error"));
}
