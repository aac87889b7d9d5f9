//! Building a source's upstream fetcher and reference catalog from its
//! configuration.

use crate::config::{ConfigError, SourceConfig, SourceKind};
use chrono::Datelike;
use freshline_core::data::{
    Catalog, CircuitBreaker, CsvCatalog, Fetcher, GroupedDailyFetcher, HttpSettings,
    PointFetcher, RetryingClient, SeriesApiFetcher, StaticCatalog,
};
use std::sync::Arc;

/// Earliest year requested from a series API when `earliest` is unset.
const DEFAULT_EARLIEST_YEAR: i32 = 2000;

/// A source's upstream: batch requests over entity ids, or one request per
/// date covering every entity.
pub enum Upstream {
    Batch(Box<dyn Fetcher>),
    Points(Box<dyn PointFetcher>),
}

impl Upstream {
    pub fn name(&self) -> &str {
        match self {
            Upstream::Batch(f) => f.name(),
            Upstream::Points(f) => f.name(),
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Upstream::Batch(f) => f.is_available(),
            Upstream::Points(f) => f.is_available(),
        }
    }
}

/// Everything a run needs to know about one source.
pub struct SourceHandle {
    pub config: SourceConfig,
    pub upstream: Upstream,
    pub catalog: Box<dyn Catalog>,
}

impl SourceHandle {
    pub fn new(config: SourceConfig, upstream: Upstream, catalog: Box<dyn Catalog>) -> Self {
        Self {
            config,
            upstream,
            catalog,
        }
    }

    /// Build the configured HTTP upstream. Credentials are read here so a
    /// missing key aborts before any request is sent.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let upstream = build_upstream(config)?;
        let catalog = load_catalog(config);
        Ok(Self::new(config.clone(), upstream, catalog))
    }
}

fn credential(config: &SourceConfig) -> Result<Option<String>, ConfigError> {
    let Some(var) = config.api_key_env.as_deref() else {
        return Ok(None);
    };
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
        _ => Err(ConfigError::MissingCredential {
            source_id: config.id.to_string(),
            var: var.to_string(),
        }),
    }
}

fn invalid(config: &SourceConfig, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        source_id: config.id.to_string(),
        reason: reason.into(),
    }
}

/// Retrying client plus endpoint for an HTTP source.
fn http_client(config: &SourceConfig) -> Result<(RetryingClient, String), ConfigError> {
    let endpoint = config
        .endpoint
        .clone()
        .ok_or_else(|| invalid(config, "endpoint is required"))?;
    let settings = HttpSettings {
        timeout: config.request_timeout(),
        max_retries: config.max_retries,
        ..HttpSettings::default()
    };
    let breaker = Arc::new(CircuitBreaker::default_provider());
    let client =
        RetryingClient::new(&settings, breaker).map_err(|e| invalid(config, e.to_string()))?;
    Ok((client, endpoint))
}

pub fn build_upstream(config: &SourceConfig) -> Result<Upstream, ConfigError> {
    match config.kind {
        SourceKind::Static => Err(invalid(
            config,
            "kind 'static' needs a fetcher supplied by the caller",
        )),
        SourceKind::GroupedDaily => {
            let key = credential(config)?.ok_or_else(|| {
                invalid(config, "api_key_env is required for grouped_daily sources")
            })?;
            let (client, endpoint) = http_client(config)?;
            Ok(Upstream::Points(Box::new(GroupedDailyFetcher::new(
                client, endpoint, key,
            ))))
        }
        SourceKind::SeriesApi => {
            let key = credential(config)?;
            let (client, endpoint) = http_client(config)?;
            let earliest_year = config
                .earliest
                .map(|d| d.year())
                .unwrap_or(DEFAULT_EARLIEST_YEAR);
            Ok(Upstream::Batch(Box::new(SeriesApiFetcher::new(
                client,
                endpoint,
                key,
                earliest_year,
            ))))
        }
    }
}

pub fn load_catalog(config: &SourceConfig) -> Box<dyn Catalog> {
    match &config.catalog.csv {
        Some(path) => Box::new(CsvCatalog::new(path.clone())),
        None => Box::new(StaticCatalog::new(config.catalog.entities.clone())),
    }
}
