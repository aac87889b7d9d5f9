//! Grouped-daily market data fetcher.
//!
//! One request returns the daily bar of every listed ticker for one date
//! (`/v2/aggs/grouped/locale/us/market/stocks/{date}`). Dates without a
//! session return an empty result set.

use super::http::RetryingClient;
use super::provider::PointFetcher;
use crate::domain::{Category, RawRecord};
use crate::error::FetchError;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct GroupedResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Option<Vec<GroupedBar>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupedBar {
    #[serde(rename = "T")]
    ticker: String,
    #[serde(rename = "o")]
    open: Option<f64>,
    #[serde(rename = "h")]
    high: Option<f64>,
    #[serde(rename = "l")]
    low: Option<f64>,
    #[serde(rename = "c")]
    close: Option<f64>,
    #[serde(rename = "v")]
    volume: Option<f64>,
    #[serde(rename = "vw")]
    vwap: Option<f64>,
    #[serde(rename = "n")]
    transactions: Option<u64>,
}

pub struct GroupedDailyFetcher {
    client: RetryingClient,
    base_url: String,
    api_key: String,
}

impl GroupedDailyFetcher {
    pub fn new(client: RetryingClient, base_url: impl Into<String>, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, date: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/grouped/locale/us/market/stocks/{}",
            self.base_url,
            date.format("%Y-%m-%d")
        )
    }
}

fn to_records(date: NaiveDate, resp: GroupedResponse) -> Result<Vec<RawRecord>, FetchError> {
    if let Some(status) = resp.status.as_deref() {
        if status.eq_ignore_ascii_case("ERROR") {
            return Err(FetchError::DataShape(
                resp.error.unwrap_or_else(|| "provider returned ERROR".into()),
            ));
        }
    }

    let date_text = date.format("%Y-%m-%d").to_string();
    let records = resp
        .results
        .unwrap_or_default()
        .into_iter()
        .map(|bar| {
            let num = |v: Option<f64>| v.map(Value::from).unwrap_or(Value::Null);
            RawRecord::new(bar.ticker)
                .with("date", date_text.clone())
                .with("open", num(bar.open))
                .with("high", num(bar.high))
                .with("low", num(bar.low))
                .with("close", num(bar.close))
                .with("volume", num(bar.volume))
                .with("vwap", num(bar.vwap))
                .with(
                    "transactions",
                    bar.transactions.map(Value::from).unwrap_or(Value::Null),
                )
        })
        .collect();
    Ok(records)
}

impl PointFetcher for GroupedDailyFetcher {
    fn name(&self) -> &str {
        "grouped_daily"
    }

    fn fetch_point(
        &self,
        _category: &Category,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let query = [
            ("adjusted", "true".to_string()),
            ("apiKey", self.api_key.clone()),
        ];
        let resp: GroupedResponse = self.client.get_json(&self.url(date), &query)?;
        to_records(date, resp)
    }

    fn is_available(&self) -> bool {
        self.client.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn parses_grouped_bars() {
        let body = r#"{
            "status": "OK",
            "resultsCount": 2,
            "results": [
                {"T": "AAPL", "o": 192.9, "h": 194.99, "l": 192.52, "c": 194.03, "v": 50080539, "vw": 193.8, "n": 612433, "t": 1717444800000},
                {"T": "ZZZ", "c": 1.5}
            ]
        }"#;
        let resp: GroupedResponse = serde_json::from_str(body).unwrap();
        let records = to_records(date(), resp).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity.as_str(), "AAPL");
        assert_eq!(records[0].fields["date"], "2024-06-03");
        assert_eq!(records[0].fields["close"], 194.03);
        assert_eq!(records[1].fields["open"], Value::Null);
    }

    #[test]
    fn empty_session_has_no_records() {
        let resp: GroupedResponse =
            serde_json::from_str(r#"{"status": "OK", "resultsCount": 0}"#).unwrap();
        assert!(to_records(date(), resp).unwrap().is_empty());
    }

    #[test]
    fn error_status_is_a_shape_error() {
        let resp: GroupedResponse =
            serde_json::from_str(r#"{"status": "ERROR", "error": "bad date"}"#).unwrap();
        assert!(matches!(
            to_records(date(), resp),
            Err(FetchError::DataShape(_))
        ));
    }
}
