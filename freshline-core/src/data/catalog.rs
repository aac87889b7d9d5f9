//! Reference catalogs: read-only enumeration of a source's valid entities.
//!
//! Entries carry an `aggregate` flag (national / composite series) and a map
//! of dimensions (area, industry, ...) used to pick diverse sentinels.
//!
//! CSV layout: `entity,aggregate,<dimension columns...>`. Only `entity` is
//! required; every column other than `entity` and `aggregate` is a dimension.

use crate::domain::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entity: EntityId,
    #[serde(default)]
    pub aggregate: bool,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: EntityId::new(entity),
            aggregate: false,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    pub fn dim(mut self, name: &str, value: &str) -> Self {
        self.dimensions.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("catalog {path} has no 'entity' column")]
    MissingEntityColumn { path: PathBuf },
}

pub trait Catalog: Send + Sync {
    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError>;

    fn entity_ids(&self) -> Result<Vec<EntityId>, CatalogError> {
        Ok(self.entries()?.into_iter().map(|e| e.entity).collect())
    }
}

/// Entries listed inline in the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(CatalogEntry::new).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.entries.clone())
    }
}

/// Catalog backed by a CSV file, re-read on every call.
#[derive(Debug, Clone)]
pub struct CsvCatalog {
    path: PathBuf,
}

impl CsvCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn csv_err(&self, source: csv::Error) -> CatalogError {
        CatalogError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

fn parse_flag(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

impl Catalog for CsvCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| self.csv_err(e))?;
        let headers = rdr.headers().map_err(|e| self.csv_err(e))?.clone();

        let entity_col = headers
            .iter()
            .position(|h| h == "entity")
            .ok_or_else(|| CatalogError::MissingEntityColumn {
                path: self.path.clone(),
            })?;
        let aggregate_col = headers.iter().position(|h| h == "aggregate");

        let mut entries = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| self.csv_err(e))?;
            let Some(entity) = record.get(entity_col).filter(|e| !e.is_empty()) else {
                continue;
            };
            let mut entry = CatalogEntry::new(entity);
            entry.aggregate = aggregate_col
                .and_then(|i| record.get(i))
                .map(parse_flag)
                .unwrap_or(false);
            for (i, header) in headers.iter().enumerate() {
                if i == entity_col || Some(i) == aggregate_col {
                    continue;
                }
                if let Some(value) = record.get(i).filter(|v| !v.is_empty()) {
                    entry.dimensions.insert(header.to_string(), value.to_string());
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn static_catalog_lists_ids_in_order() {
        let cat = StaticCatalog::from_ids(["SPY", "QQQ"]);
        assert_eq!(
            cat.entity_ids().unwrap(),
            vec![EntityId::new("SPY"), EntityId::new("QQQ")]
        );
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn csv_catalog_reads_flags_and_dimensions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "entity,aggregate,area,industry").unwrap();
        writeln!(file, "CUUR0000SA0, true ,US,all").unwrap();
        writeln!(file, "CUUR0100SA0,0,Northeast,").unwrap();
        writeln!(file, ",1,blank,row").unwrap();

        let entries = CsvCatalog::new(file.path()).entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].aggregate);
        assert_eq!(entries[0].dimensions["industry"], "all");
        assert!(!entries[1].aggregate);
        assert_eq!(entries[1].dimensions.get("industry"), None);
        assert_eq!(entries[1].dimensions["area"], "Northeast");
    }

    #[test]
    fn csv_without_entity_column_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "series,area").unwrap();
        writeln!(file, "A,US").unwrap();
        let err = CsvCatalog::new(file.path()).entries().unwrap_err();
        assert!(matches!(err, CatalogError::MissingEntityColumn { .. }));
    }
}
