//! TOML configuration: database, run log and one `[[sources]]` table per
//! upstream source.
//!
//! ```toml
//! database = "data/freshline.db"
//! run_log = "data/runs.jsonl"
//!
//! [[sources]]
//! id = "bls_cpi"
//! kind = "series_api"
//! endpoint = "https://api.bls.gov/publicAPI/v2/timeseries/data/"
//! api_key_env = "BLS_API_KEY"
//! categories = ["observations"]
//! batch_size = 50
//! daily_quota = 500
//!
//! [sources.mapping]
//! point_field = "date"
//! point_kind = "date"
//! value_fields = ["value"]
//! label_fields = ["footnotes"]
//! ```

use chrono::NaiveDate;
use freshline_core::data::CatalogEntry;
use freshline_core::domain::{Category, SourceId};
use freshline_core::error::FatalError;
use freshline_core::gap::{BackfillConfig, TradingCalendar};
use freshline_core::mapper::RecordMapper;
use freshline_core::planner::RateLimit;
use freshline_core::sanitize::FieldPolicies;
use freshline_core::sentinel::{SentinelComposition, Tolerance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config for source '{source_id}': {reason}")]
    Invalid { source_id: String, reason: String },

    #[error("source '{source_id}' needs credential in environment variable {var}")]
    MissingCredential { source_id: String, var: String },

    #[error("unknown source '{0}'")]
    UnknownSource(String),
}

impl From<ConfigError> for FatalError {
    fn from(e: ConfigError) -> Self {
        FatalError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshlineConfig {
    pub database: PathBuf,
    #[serde(default = "default_run_log")]
    pub run_log: PathBuf,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_run_log() -> PathBuf {
    PathBuf::from("runs.jsonl")
}

impl FreshlineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(invalid(&source.id, "duplicate source id"));
            }
            source.validate()?;
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .iter()
            .find(|s| s.id.as_str() == id)
            .ok_or_else(|| ConfigError::UnknownSource(id.to_string()))
    }
}

/// How the source's upstream is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One request per date returns every entity (market data).
    GroupedDaily,
    /// Batch of series ids with a year range (statistical agencies).
    SeriesApi,
    /// Fetcher supplied by the embedding program.
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub kind: SourceKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_categories")]
    pub categories: Vec<Category>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    #[serde(default)]
    pub throttle: Option<RateLimit>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First point requested by force runs.
    #[serde(default)]
    pub earliest: Option<NaiveDate>,
    pub mapping: RecordMapper,
    #[serde(default)]
    pub sanitize: FieldPolicies,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub sentinel: SentinelSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
    /// Whether `update` refills history instead of resuming.
    #[serde(default)]
    pub full_update_force: bool,
}

fn default_categories() -> Vec<Category> {
    vec![Category::new("observations")]
}

fn default_batch_size() -> usize {
    50
}

fn default_daily_quota() -> u32 {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Category the sentinels are read from.
    pub fn sentinel_category(&self) -> Category {
        self.sentinel
            .category
            .clone()
            .or_else(|| self.categories.first().cloned())
            .unwrap_or_else(|| Category::new("observations"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.as_str().trim().is_empty() {
            return Err(invalid(&self.id, "id must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid(&self.id, "batch_size must be > 0"));
        }
        if self.categories.is_empty() {
            return Err(invalid(&self.id, "at least one category is required"));
        }
        if matches!(self.kind, SourceKind::GroupedDaily | SourceKind::SeriesApi)
            && self.endpoint.is_none()
        {
            return Err(invalid(&self.id, "endpoint is required for HTTP sources"));
        }
        if self.mapping.point_field.is_empty() {
            return Err(invalid(&self.id, "mapping.point_field must not be empty"));
        }
        let policies =
            std::iter::once(&self.sanitize.default).chain(self.sanitize.fields.values());
        for policy in policies {
            if !policy.is_valid() {
                return Err(invalid(
                    &self.id,
                    format!("invalid sanitization policy {policy:?}"),
                ));
            }
        }
        if !self.sentinel.composition().is_valid() {
            return Err(invalid(
                &self.id,
                "sentinel aggregate + diverse must fit in size",
            ));
        }
        if self.backfill.max_days == 0 || self.backfill.max_days > BackfillConfig::MAX_DAYS {
            return Err(invalid(
                &self.id,
                format!("backfill.max_days must be in 1..={}", BackfillConfig::MAX_DAYS),
            ));
        }
        if self.catalog.csv.is_some() && !self.catalog.entities.is_empty() {
            return Err(invalid(
                &self.id,
                "catalog takes either csv or inline entities, not both",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub max_days: u32,
    pub max_fills: u32,
    pub weekdays_only: bool,
    pub holidays: BTreeSet<NaiveDate>,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        let limits = BackfillConfig::default();
        Self {
            max_days: limits.max_days,
            max_fills: limits.max_fills,
            weekdays_only: true,
            holidays: BTreeSet::new(),
        }
    }
}

impl BackfillSettings {
    pub fn limits(&self) -> BackfillConfig {
        BackfillConfig {
            max_days: self.max_days,
            max_fills: self.max_fills,
        }
    }

    pub fn calendar(&self) -> TradingCalendar {
        TradingCalendar {
            weekdays_only: self.weekdays_only,
            holidays: self.holidays.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelSettings {
    pub size: usize,
    pub aggregate: usize,
    pub diverse: usize,
    pub seed: Option<u64>,
    /// Field compared against the baseline.
    pub field: String,
    pub category: Option<Category>,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    /// How far back a check asks for data.
    pub lookback_days: u32,
}

impl Default for SentinelSettings {
    fn default() -> Self {
        let composition = SentinelComposition::default();
        let tolerance = Tolerance::default();
        Self {
            size: composition.size,
            aggregate: composition.aggregate,
            diverse: composition.diverse,
            seed: composition.seed,
            field: "value".to_string(),
            category: None,
            abs_tolerance: tolerance.abs,
            rel_tolerance: tolerance.rel,
            lookback_days: 400,
        }
    }
}

impl SentinelSettings {
    pub fn composition(&self) -> SentinelComposition {
        SentinelComposition {
            size: self.size,
            aggregate: self.aggregate,
            diverse: self.diverse,
            seed: self.seed,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            abs: self.abs_tolerance,
            rel: self.rel_tolerance,
        }
    }
}

/// Reference catalog: inline entities or a CSV file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSettings {
    #[serde(default)]
    pub csv: Option<PathBuf>,
    #[serde(default)]
    pub entities: Vec<CatalogEntry>,
}

fn invalid(id: &SourceId, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        source_id: id.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshline_core::domain::PointKind;

    const SAMPLE: &str = r#"
database = "data/freshline.db"

[[sources]]
id = "bls_cpi"
kind = "series_api"
endpoint = "https://example.test/timeseries"
api_key_env = "BLS_API_KEY"
batch_size = 25
daily_quota = 500
earliest = "2000-01-01"

[sources.throttle]
max_requests = 5
per_secs = 10.0

[sources.mapping]
point_field = "date"
point_kind = "date"
value_fields = ["value"]
label_fields = ["footnotes"]

[sources.sanitize.default]
max_abs_value = 1e14

[sources.sanitize.fields.value]
max_abs_value = 1e9
decimal_scale = 3

[sources.sentinel]
size = 10
aggregate = 2
diverse = 4
seed = 7

[[sources.catalog.entities]]
entity = "CUUR0000SA0"
aggregate = true

[[sources.catalog.entities]]
entity = "CUURS49ASA0"
dimensions = { area = "west" }

[[sources]]
id = "stocks"
kind = "grouped_daily"
endpoint = "https://example.test"
api_key_env = "MARKET_API_KEY"
categories = ["daily_bars"]
daily_quota = 5

[sources.mapping]
point_field = "date"
point_kind = "date"
value_fields = ["open", "high", "low", "close", "volume"]

[sources.backfill]
max_days = 45
max_fills = 5
holidays = ["2024-12-25"]
"#;

    #[test]
    fn parses_full_config() {
        let config = FreshlineConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.run_log, PathBuf::from("runs.jsonl"));
        assert_eq!(config.sources.len(), 2);

        let cpi = config.source("bls_cpi").unwrap();
        assert_eq!(cpi.kind, SourceKind::SeriesApi);
        assert_eq!(cpi.batch_size, 25);
        assert_eq!(cpi.categories, vec![Category::new("observations")]);
        assert_eq!(cpi.mapping.point_kind, PointKind::Date);
        assert_eq!(cpi.sanitize.policy_for("value").max_abs_value, 1e9);
        assert_eq!(cpi.sanitize.policy_for("value").decimal_scale, 3);
        assert_eq!(cpi.sanitize.policy_for("other").max_abs_value, 1e14);
        assert_eq!(cpi.sentinel.composition().seed, Some(7));
        assert_eq!(cpi.sentinel.field, "value");
        assert_eq!(cpi.catalog.entities.len(), 2);
        assert!(cpi.catalog.entities[0].aggregate);
        assert_eq!(cpi.throttle.unwrap().max_requests, 5);

        let stocks = config.source("stocks").unwrap();
        assert_eq!(stocks.backfill.limits().max_days, 45);
        assert!(stocks.backfill.calendar().weekdays_only);
        assert_eq!(stocks.sentinel_category(), Category::new("daily_bars"));
        assert!(!stocks.full_update_force);
    }

    #[test]
    fn unknown_source_is_reported() {
        let config = FreshlineConfig::from_toml(SAMPLE).unwrap();
        assert!(matches!(
            config.source("nope"),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let text = SAMPLE.replace("batch_size = 25", "batch_size = 0");
        let err = FreshlineConfig::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn out_of_range_backfill_window_is_rejected() {
        for days in ["0", "4294967295"] {
            let text = SAMPLE.replace("max_days = 45", &format!("max_days = {days}"));
            let err = FreshlineConfig::from_toml(&text).unwrap_err();
            assert!(err.to_string().contains("max_days"), "{days}: {err}");
        }
    }

    #[test]
    fn oversized_sentinel_mix_is_rejected() {
        let text = SAMPLE.replace("diverse = 4", "diverse = 40");
        assert!(matches!(
            FreshlineConfig::from_toml(&text),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let text = SAMPLE.replace("id = \"stocks\"", "id = \"bls_cpi\"");
        let err = FreshlineConfig::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn config_errors_become_fatal() {
        let fatal: FatalError = ConfigError::UnknownSource("x".into()).into();
        assert!(matches!(fatal, FatalError::Config(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FreshlineConfig::from_file(Path::new("/nonexistent/freshline.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
