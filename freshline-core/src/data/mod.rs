pub mod catalog;
pub mod circuit_breaker;
pub mod grouped_daily;
pub mod http;
pub mod provider;
pub mod series_api;

pub use catalog::{Catalog, CatalogEntry, CatalogError, CsvCatalog, StaticCatalog};
pub use circuit_breaker::CircuitBreaker;
pub use grouped_daily::GroupedDailyFetcher;
pub use http::{HttpSettings, RetryingClient};
pub use provider::{Fetcher, PointFetcher};
pub use series_api::SeriesApiFetcher;
