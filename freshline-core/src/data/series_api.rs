//! Statistical time-series API fetcher.
//!
//! Posts a batch of series ids with a year range and receives
//! `{year, period, value, footnotes}` rows per series. Periods map to dates:
//! `M01..M12` to the first of the month, `Q01..Q04` to the first day of the
//! quarter, `A01` to January 1st. `M13` (annual average) is dropped. The API
//! serves at most [`MAX_YEARS_PER_REQUEST`] years per call, so longer ranges
//! are split.

use super::http::RetryingClient;
use super::provider::Fetcher;
use crate::domain::{Category, EntityId, RawRecord, SyncPoint};
use crate::error::FetchError;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_YEARS_PER_REQUEST: i32 = 20;

#[derive(Debug, Serialize)]
struct SeriesRequest<'a> {
    seriesid: Vec<&'a str>,
    startyear: String,
    endyear: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    registrationkey: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    status: String,
    #[serde(default)]
    message: Vec<String>,
    #[serde(rename = "Results", default)]
    results: Option<SeriesResults>,
}

#[derive(Debug, Deserialize)]
struct SeriesResults {
    #[serde(default)]
    series: Vec<SeriesData>,
}

#[derive(Debug, Deserialize)]
struct SeriesData {
    #[serde(rename = "seriesID")]
    series_id: String,
    #[serde(default)]
    data: Vec<SeriesRow>,
}

#[derive(Debug, Deserialize)]
struct SeriesRow {
    year: String,
    period: String,
    value: String,
    #[serde(default)]
    footnotes: Vec<Footnote>,
}

#[derive(Debug, Default, Deserialize)]
struct Footnote {
    #[serde(default)]
    code: Option<String>,
}

pub struct SeriesApiFetcher {
    client: RetryingClient,
    endpoint: String,
    api_key: Option<String>,
    earliest_year: i32,
}

impl SeriesApiFetcher {
    pub fn new(
        client: RetryingClient,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        earliest_year: i32,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            earliest_year,
        }
    }

    fn year_range(&self, since: Option<SyncPoint>) -> (i32, i32) {
        let end = Utc::now().year();
        let start = match since.and_then(|p| p.as_date()) {
            Some(d) => d.year(),
            None => self.earliest_year,
        };
        (start.min(end), end)
    }
}

/// `[start, end]` split into spans the API accepts.
fn year_chunks(start: i32, end: i32) -> Vec<(i32, i32)> {
    let mut chunks = Vec::new();
    let mut from = start;
    while from <= end {
        let to = (from + MAX_YEARS_PER_REQUEST - 1).min(end);
        chunks.push((from, to));
        from = to + 1;
    }
    chunks
}

/// Calendar date for a `(year, period)` pair, `None` for periods without one.
pub fn period_date(year: i32, period: &str) -> Option<NaiveDate> {
    let kind = period.get(..1)?;
    let num: u32 = period.get(1..)?.parse().ok()?;
    let month = match kind {
        "M" if (1..=12).contains(&num) => num,
        "Q" if (1..=4).contains(&num) => (num - 1) * 3 + 1,
        "A" if num == 1 => 1,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn check_status(resp: &SeriesResponse) -> Result<(), FetchError> {
    if resp.status == "REQUEST_SUCCEEDED" {
        return Ok(());
    }
    let detail = resp.message.join("; ");
    let lower = detail.to_ascii_lowercase();
    if lower.contains("threshold") {
        return Err(FetchError::RateLimited {
            retry_after_secs: 24 * 60 * 60,
        });
    }
    if lower.contains("key") && (lower.contains("invalid") || lower.contains("expired")) {
        return Err(FetchError::Fatal(detail));
    }
    Err(FetchError::DataShape(format!("{}: {detail}", resp.status)))
}

fn to_records(resp: SeriesResponse) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for series in resp.results.map(|r| r.series).unwrap_or_default() {
        for row in series.data {
            if row.period == "M13" {
                continue;
            }
            let mut record = RawRecord::new(series.series_id.clone())
                .with("year", row.year.clone())
                .with("period", row.period.clone())
                .with("value", row.value);
            if let Some(date) = row
                .year
                .parse::<i32>()
                .ok()
                .and_then(|y| period_date(y, &row.period))
            {
                record = record.with("date", date.format("%Y-%m-%d").to_string());
            }
            let codes: Vec<String> = row
                .footnotes
                .into_iter()
                .filter_map(|f| f.code)
                .filter(|c| !c.is_empty())
                .collect();
            if !codes.is_empty() {
                record = record.with("footnotes", codes.join(","));
            }
            records.push(record);
        }
    }
    records
}

impl Fetcher for SeriesApiFetcher {
    fn name(&self) -> &str {
        "series_api"
    }

    fn fetch(
        &self,
        entity_ids: &[EntityId],
        _category: &Category,
        since: Option<SyncPoint>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let (start, end) = self.year_range(since);
        let ids: Vec<&str> = entity_ids.iter().map(|e| e.as_str()).collect();

        let mut records = Vec::new();
        for (from, to) in year_chunks(start, end) {
            let body = SeriesRequest {
                seriesid: ids.clone(),
                startyear: from.to_string(),
                endyear: to.to_string(),
                registrationkey: self.api_key.as_deref(),
            };
            let resp: SeriesResponse = self.client.post_json(&self.endpoint, &body)?;
            check_status(&resp)?;
            records.extend(to_records(resp));
        }
        Ok(records)
    }

    fn request_cost(&self, since: Option<SyncPoint>) -> u32 {
        let (start, end) = self.year_range(since);
        year_chunks(start, end).len().max(1) as u32
    }

    fn is_available(&self) -> bool {
        self.client.is_available()
    }
}
