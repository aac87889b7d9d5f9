//! Sentinel sampling and change detection.
//!
//! A sentinel sample is a small fixed-composition subset of a source's
//! entities: aggregate series first, then entities chosen greedily for
//! dimension coverage, then a seeded random remainder. Re-fetching only the
//! sample and comparing it against stored baselines tells whether the source
//! changed upstream at all. The composition is a detection-economics knob,
//! not a correctness guarantee.

use crate::data::catalog::CatalogEntry;
use crate::domain::{EntityId, SentinelReading, SentinelRole, SentinelValue, SourceId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelComposition {
    pub size: usize,
    pub aggregate: usize,
    pub diverse: usize,
    /// Fixed seed for the random remainder. `None` draws a fresh sample on
    /// every selection.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SentinelComposition {
    fn default() -> Self {
        Self {
            size: 50,
            aggregate: 10,
            diverse: 20,
            seed: None,
        }
    }
}

impl SentinelComposition {
    pub fn is_valid(&self) -> bool {
        self.size > 0 && self.aggregate + self.diverse <= self.size
    }
}

/// When two continuous values count as different.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            abs: 1e-9,
            rel: 1e-9,
        }
    }
}

impl Tolerance {
    pub fn exact() -> Self {
        Self { abs: 0.0, rel: 0.0 }
    }

    pub fn differs(&self, a: f64, b: f64) -> bool {
        let limit = self.abs.max(self.rel * a.abs().max(b.abs()));
        (a - b).abs() > limit
    }
}

/// RNG for the random remainder, derived from the seed and the source id.
fn sample_rng(source: &SourceId, seed: u64) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(source.as_str().as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(hash.as_bytes());
    StdRng::from_seed(bytes)
}

/// Pick up to `composition.size` sentinels from `candidates`.
pub fn select(
    source: &SourceId,
    candidates: &[CatalogEntry],
    composition: &SentinelComposition,
) -> Vec<(EntityId, SentinelRole)> {
    let mut chosen: Vec<(EntityId, SentinelRole)> = Vec::with_capacity(composition.size);
    let mut taken: BTreeSet<&EntityId> = BTreeSet::new();

    for entry in candidates.iter().filter(|e| e.aggregate) {
        if chosen.len() >= composition.aggregate.min(composition.size) {
            break;
        }
        if taken.insert(&entry.entity) {
            chosen.push((entry.entity.clone(), SentinelRole::Aggregate));
        }
    }

    // Greedy coverage: each pick adds the most unseen (dimension, value) pairs.
    let diverse_target = (chosen.len() + composition.diverse).min(composition.size);
    let mut covered: BTreeSet<(&str, &str)> = BTreeSet::new();
    while chosen.len() < diverse_target {
        let best = candidates
            .iter()
            .filter(|e| !taken.contains(&e.entity))
            .map(|e| {
                let gain = e
                    .dimensions
                    .iter()
                    .filter(|(k, v)| !covered.contains(&(k.as_str(), v.as_str())))
                    .count();
                (gain, e)
            })
            .fold(None::<(usize, &CatalogEntry)>, |best, (gain, e)| match best {
                Some((g, _)) if g >= gain => best,
                _ => Some((gain, e)),
            });
        let Some((gain, entry)) = best else { break };
        if gain == 0 {
            break;
        }
        covered.extend(entry.dimensions.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        taken.insert(&entry.entity);
        chosen.push((entry.entity.clone(), SentinelRole::Diverse));
    }

    let mut rest: Vec<&CatalogEntry> = candidates
        .iter()
        .filter(|e| !taken.contains(&e.entity))
        .collect();
    let seed = composition.seed.unwrap_or_else(rand::random);
    rest.shuffle(&mut sample_rng(source, seed));
    for entry in rest {
        if chosen.len() >= composition.size {
            break;
        }
        if taken.insert(&entry.entity) {
            chosen.push((entry.entity.clone(), SentinelRole::Random));
        }
    }
    chosen
}

/// Whether a fresh reading differs from its baseline.
///
/// A sentinel absent from the response is not a change. A baseline with no
/// value that now has one is. A new point counts even if the value matches.
pub fn has_changed(baseline: &SentinelReading, current: &SentinelReading, tol: &Tolerance) -> bool {
    if current.point.is_none() && current.value == SentinelValue::Missing {
        return false;
    }
    if baseline.point != current.point {
        return true;
    }
    match (&baseline.value, &current.value) {
        (SentinelValue::Numeric(a), SentinelValue::Numeric(b)) => tol.differs(*a, *b),
        (SentinelValue::Categorical(a), SentinelValue::Categorical(b)) => a != b,
        (SentinelValue::Missing, SentinelValue::Missing) => false,
        _ => true,
    }
}

/// Number of sentinels whose current reading differs from the baseline.
/// Sentinels without a current reading are ignored.
pub fn count_changes<'a, F>(
    baselines: impl IntoIterator<Item = (&'a EntityId, &'a SentinelReading)>,
    mut current: F,
    tol: &Tolerance,
) -> usize
where
    F: FnMut(&EntityId) -> Option<SentinelReading>,
{
    baselines
        .into_iter()
        .filter(|(entity, baseline)| {
            current(*entity).is_some_and(|reading| has_changed(baseline, &reading, tol))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SyncPoint;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn catalog() -> Vec<CatalogEntry> {
        let mut entries = vec![
            CatalogEntry::new("US_ALL").aggregate().dim("area", "US"),
            CatalogEntry::new("US_FOOD").aggregate().dim("area", "US").dim("item", "food"),
        ];
        for area in ["NE", "MW", "S", "W"] {
            for item in ["food", "energy", "shelter"] {
                entries.push(
                    CatalogEntry::new(format!("{area}_{item}"))
                        .dim("area", area)
                        .dim("item", item),
                );
            }
        }
        entries
    }

    fn reading(day: u32, value: f64) -> SentinelReading {
        SentinelReading {
            point: Some(SyncPoint::Date(NaiveDate::from_ymd_opt(2024, 5, day).unwrap())),
            value: SentinelValue::Numeric(value),
        }
    }

    #[test]
    fn composition_is_respected() {
        let comp = SentinelComposition {
            size: 8,
            aggregate: 2,
            diverse: 3,
            seed: Some(7),
        };
        let picked = select(&SourceId::new("cpi"), &catalog(), &comp);
        assert_eq!(picked.len(), 8);
        let count = |role| picked.iter().filter(|(_, r)| *r == role).count();
        assert_eq!(count(SentinelRole::Aggregate), 2);
        assert_eq!(count(SentinelRole::Diverse), 3);
        assert_eq!(count(SentinelRole::Random), 3);

        let unique: BTreeSet<_> = picked.iter().map(|(e, _)| e).collect();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn diverse_picks_cover_new_dimensions() {
        let comp = SentinelComposition {
            size: 4,
            aggregate: 0,
            diverse: 4,
            seed: Some(1),
        };
        let picked = select(&SourceId::new("cpi"), &catalog(), &comp);
        let entries: BTreeMap<_, _> = catalog().into_iter().map(|e| (e.entity.clone(), e)).collect();
        let areas: BTreeSet<_> = picked
            .iter()
            .map(|(e, _)| entries[e].dimensions["area"].clone())
            .collect();
        assert_eq!(areas.len(), 4);
    }

    #[test]
    fn seeded_selection_is_deterministic() {
        let comp = SentinelComposition {
            size: 10,
            aggregate: 1,
            diverse: 1,
            seed: Some(42),
        };
        let a = select(&SourceId::new("cpi"), &catalog(), &comp);
        let b = select(&SourceId::new("cpi"), &catalog(), &comp);
        assert_eq!(a, b);
    }

    #[test]
    fn small_catalog_yields_fewer_sentinels() {
        let picked = select(
            &SourceId::new("cpi"),
            &catalog()[..3],
            &SentinelComposition::default(),
        );
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn change_rules() {
        let tol = Tolerance::default();
        assert!(!has_changed(&reading(1, 100.0), &reading(1, 100.0), &tol));
        assert!(has_changed(&reading(1, 100.0), &reading(1, 100.5), &tol));
        assert!(has_changed(&reading(1, 100.0), &reading(2, 100.0), &tol));
        assert!(!has_changed(&reading(1, 100.0), &SentinelReading::missing(), &tol));
        assert!(has_changed(&SentinelReading::missing(), &reading(1, 1.0), &tol));

        let loose = Tolerance { abs: 0.0, rel: 0.01 };
        assert!(!has_changed(&reading(1, 100.0), &reading(1, 100.5), &loose));

        let cat = |s: &str| SentinelReading {
            point: None,
            value: SentinelValue::Categorical(s.into()),
        };
        assert!(has_changed(&cat("P"), &cat("R"), &Tolerance::exact()));
    }

    #[test]
    fn counts_only_changed_sentinels() {
        let baselines = vec![
            (EntityId::new("A"), reading(1, 1.0)),
            (EntityId::new("B"), reading(1, 2.0)),
            (EntityId::new("C"), reading(1, 3.0)),
        ];
        let n = count_changes(
            baselines.iter().map(|(e, r)| (e, r)),
            |e| match e.as_str() {
                "A" => Some(reading(1, 1.0)),
                "B" => Some(reading(1, 2.5)),
                _ => None,
            },
            &Tolerance::default(),
        );
        assert_eq!(n, 1);
    }
}
