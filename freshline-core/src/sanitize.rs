//! Value sanitizer.
//!
//! Every numeric field is checked against its column bounds immediately before
//! persistence. Values beyond 90% of `max_abs_value` are either nulled or
//! clamped to that threshold; the sanitizer never fails.

use crate::domain::Observation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fraction of the storage bound a value may reach.
pub const SAFETY_FACTOR: f64 = 0.9;

/// Above this magnitude (times 10^scale) an f64 has no fractional digits left.
const EXACT_INTEGER_LIMIT: f64 = 4_503_599_627_370_496.0; // 2^52

/// Storage bounds for one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SanitizationPolicy {
    pub max_abs_value: f64,
    #[serde(default = "default_decimal_scale")]
    pub decimal_scale: u32,
    #[serde(default)]
    pub null_on_exceed: bool,
}

fn default_decimal_scale() -> u32 {
    6
}

impl SanitizationPolicy {
    pub fn clamp(max_abs_value: f64) -> Self {
        Self {
            max_abs_value,
            decimal_scale: default_decimal_scale(),
            null_on_exceed: false,
        }
    }

    pub fn null_on_exceed(max_abs_value: f64) -> Self {
        Self {
            max_abs_value,
            decimal_scale: default_decimal_scale(),
            null_on_exceed: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.max_abs_value.is_finite() && self.max_abs_value > 0.0 && self.decimal_scale <= 15
    }

    /// Largest magnitude stored unchanged.
    pub fn bound(&self) -> f64 {
        SAFETY_FACTOR * self.max_abs_value
    }
}

impl Default for SanitizationPolicy {
    /// NUMERIC(20, 6)-style column.
    fn default() -> Self {
        Self::clamp(1e14)
    }
}

/// Sanitize one value. Returns the value safe to store and whether it was
/// altered (clamped or nulled).
pub fn sanitize(value: f64, policy: &SanitizationPolicy) -> (Option<f64>, bool) {
    let bound = policy.bound();

    if value.is_nan() {
        return (None, true);
    }

    if value.abs() > bound {
        if policy.null_on_exceed {
            return (None, true);
        }
        return (Some(bound.copysign(value)), true);
    }

    let rounded = round_to_scale(value, policy.decimal_scale);
    if rounded.abs() > bound {
        return (Some(bound.copysign(value)), true);
    }
    (Some(rounded), false)
}

/// Round half away from zero to `scale` decimal places.
fn round_to_scale(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    let scaled = value * factor;
    if !scaled.is_finite() || scaled.abs() >= EXACT_INTEGER_LIMIT {
        return value;
    }
    scaled.round() / factor
}

/// Per-field policies with a fallback for unlisted fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPolicies {
    #[serde(default)]
    pub default: SanitizationPolicy,
    #[serde(default)]
    pub fields: BTreeMap<String, SanitizationPolicy>,
}

impl FieldPolicies {
    pub fn new(default: SanitizationPolicy) -> Self {
        Self {
            default,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: &str, policy: SanitizationPolicy) -> Self {
        self.fields.insert(field.to_string(), policy);
        self
    }

    pub fn policy_for(&self, field: &str) -> &SanitizationPolicy {
        self.fields.get(field).unwrap_or(&self.default)
    }

    /// Sanitize every numeric field of an observation in place. Returns the
    /// number of values that were clamped or nulled.
    pub fn apply(&self, obs: &mut Observation) -> usize {
        let mut altered = 0;
        for (field, slot) in obs.values.iter_mut() {
            if let Some(v) = *slot {
                let (clean, was_clamped) = sanitize(v, self.policy_for(field));
                if was_clamped {
                    altered += 1;
                }
                *slot = clean;
            }
        }
        altered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, EntityId, SyncPoint};

    #[test]
    fn oversized_value_is_clamped_to_threshold() {
        let policy = SanitizationPolicy::clamp(1e9);
        let (clean, clamped) = sanitize(1e12, &policy);
        assert_eq!(clean, Some(9e8));
        assert!(clamped);
    }

    #[test]
    fn negative_values_keep_their_sign() {
        let policy = SanitizationPolicy::clamp(1e9);
        assert_eq!(sanitize(-5e11, &policy), (Some(-9e8), true));
    }

    #[test]
    fn null_policy_drops_oversized_values() {
        let policy = SanitizationPolicy::null_on_exceed(1e9);
        assert_eq!(sanitize(1e12, &policy), (None, true));
        assert_eq!(sanitize(12.5, &policy), (Some(12.5), false));
    }

    #[test]
    fn value_at_threshold_is_not_clamped() {
        let policy = SanitizationPolicy::clamp(1e9);
        assert_eq!(sanitize(9e8, &policy), (Some(9e8), false));
    }

    #[test]
    fn in_bound_values_are_rounded_to_scale() {
        let policy = SanitizationPolicy {
            max_abs_value: 1e6,
            decimal_scale: 2,
            null_on_exceed: false,
        };
        assert_eq!(sanitize(1.23456, &policy), (Some(1.23), false));
        let whole = SanitizationPolicy {
            decimal_scale: 0,
            ..policy
        };
        assert_eq!(sanitize(-2.5, &whole), (Some(-3.0), false));
    }

    #[test]
    fn non_finite_values_are_made_safe() {
        let policy = SanitizationPolicy::clamp(1e9);
        assert_eq!(sanitize(f64::NAN, &policy), (None, true));
        assert_eq!(sanitize(f64::INFINITY, &policy), (Some(9e8), true));
        assert_eq!(sanitize(f64::NEG_INFINITY, &policy), (Some(-9e8), true));
    }

    #[test]
    fn field_policies_apply_per_field() {
        let policies = FieldPolicies::new(SanitizationPolicy::clamp(1e9))
            .with_field("volume", SanitizationPolicy::null_on_exceed(1e6));
        let mut obs = Observation {
            entity: EntityId::new("AAPL"),
            category: Category::new("daily_bars"),
            point: SyncPoint::Version(1),
            values: BTreeMap::new(),
            labels: BTreeMap::new(),
        };
        obs.values.insert("close".into(), Some(1e12));
        obs.values.insert("volume".into(), Some(5e6));
        obs.values.insert("open".into(), None);

        assert_eq!(policies.apply(&mut obs), 2);
        assert_eq!(obs.values["close"], Some(9e8));
        assert_eq!(obs.values["volume"], None);
        assert_eq!(obs.values["open"], None);
    }
}
