//! Raw-record mapping.
//!
//! Turns a provider's JSON fields into an [`Observation`]. Sources describe
//! their record layout as data (`point_field`, value and label fields) instead
//! of implementing a mapper per dataset.

use crate::domain::{Category, Observation, PointKind, RawRecord, SyncPoint};
use crate::error::DataShapeError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Upstream markers meaning "no value for this period".
const NULL_MARKERS: &[&str] = &["", "-", "(NA)", "N/A", "NaN", "."];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMapper {
    /// Field holding the record's sync point.
    pub point_field: String,
    pub point_kind: PointKind,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Numeric fields, stored sanitized.
    pub value_fields: Vec<String>,
    /// Categorical fields, stored verbatim.
    #[serde(default)]
    pub label_fields: Vec<String>,
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

impl RecordMapper {
    pub fn dated(point_field: &str, value_fields: &[&str]) -> Self {
        Self {
            point_field: point_field.to_string(),
            point_kind: PointKind::Date,
            date_format: default_date_format(),
            value_fields: value_fields.iter().map(|f| f.to_string()).collect(),
            label_fields: Vec::new(),
        }
    }

    pub fn with_labels(mut self, label_fields: &[&str]) -> Self {
        self.label_fields = label_fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn map(&self, raw: &RawRecord, category: &Category) -> Result<Observation, DataShapeError> {
        let point = self.parse_point(raw)?;

        let mut values = BTreeMap::new();
        for field in &self.value_fields {
            let v = match raw.fields.get(field) {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => parse_numeric(s).map_err(|_| {
                    shape(raw, format!("field '{field}' is not numeric: {s:?}"))
                })?,
                Some(other) => {
                    return Err(shape(
                        raw,
                        format!("field '{field}' has unexpected type: {other}"),
                    ))
                }
            };
            values.insert(field.clone(), v);
        }

        let mut labels = BTreeMap::new();
        for field in &self.label_fields {
            match raw.fields.get(field) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => {
                    labels.insert(field.clone(), s.clone());
                }
                Some(other) => {
                    labels.insert(field.clone(), other.to_string());
                }
            }
        }

        Ok(Observation {
            entity: raw.entity.clone(),
            category: category.clone(),
            point,
            values,
            labels,
        })
    }

    fn parse_point(&self, raw: &RawRecord) -> Result<SyncPoint, DataShapeError> {
        let field = raw
            .fields
            .get(&self.point_field)
            .ok_or_else(|| shape(raw, format!("missing point field '{}'", self.point_field)))?;

        match self.point_kind {
            PointKind::Date => {
                let text = field
                    .as_str()
                    .ok_or_else(|| shape(raw, format!("point field is not a string: {field}")))?;
                NaiveDate::parse_from_str(text, &self.date_format)
                    .map(SyncPoint::Date)
                    .map_err(|e| shape(raw, format!("invalid date {text:?}: {e}")))
            }
            PointKind::Version => {
                let version = match field {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                version
                    .map(SyncPoint::Version)
                    .ok_or_else(|| shape(raw, format!("invalid version marker: {field}")))
            }
        }
    }
}

fn parse_numeric(s: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let trimmed = s.trim();
    if NULL_MARKERS.contains(&trimmed) {
        return Ok(None);
    }
    trimmed.replace(',', "").parse::<f64>().map(Some)
}

fn shape(raw: &RawRecord, reason: String) -> DataShapeError {
    DataShapeError {
        entity: raw.entity.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category() -> Category {
        Category::new("observations")
    }

    #[test]
    fn maps_dated_record() {
        let mapper = RecordMapper::dated("date", &["value"]).with_labels(&["footnote"]);
        let raw = RawRecord::new("CUUR0000SA0")
            .with("date", "2024-05-01")
            .with("value", "313,225.5")
            .with("footnote", "P");

        let obs = mapper.map(&raw, &category()).unwrap();
        assert_eq!(
            obs.point,
            SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
        );
        assert_eq!(obs.values["value"], Some(313225.5));
        assert_eq!(obs.labels["footnote"], "P");
    }

    #[test]
    fn null_markers_become_missing_values() {
        let mapper = RecordMapper::dated("date", &["value"]);
        let raw = RawRecord::new("X").with("date", "2024-05-01").with("value", "-");
        assert_eq!(mapper.map(&raw, &category()).unwrap().values["value"], None);
    }

    #[test]
    fn garbage_value_is_a_shape_error() {
        let mapper = RecordMapper::dated("date", &["value"]);
        let raw = RawRecord::new("X")
            .with("date", "2024-05-01")
            .with("value", "twelve");
        let err = mapper.map(&raw, &category()).unwrap_err();
        assert!(err.reason.contains("not numeric"));
    }

    #[test]
    fn missing_point_is_a_shape_error() {
        let mapper = RecordMapper::dated("date", &["value"]);
        let raw = RawRecord::new("X").with("value", 1.0);
        assert!(mapper.map(&raw, &category()).is_err());
    }

    #[test]
    fn version_points_accept_numbers_and_strings() {
        let mapper = RecordMapper {
            point_field: "rev".into(),
            point_kind: PointKind::Version,
            date_format: default_date_format(),
            value_fields: vec![],
            label_fields: vec![],
        };
        let a = RawRecord::new("X").with("rev", 7);
        let b = RawRecord::new("X").with("rev", "8");
        assert_eq!(mapper.map(&a, &category()).unwrap().point, SyncPoint::Version(7));
        assert_eq!(mapper.map(&b, &category()).unwrap().point, SyncPoint::Version(8));
    }
}
