//! Rate-limited request planner.
//!
//! Splits the entities of a source into batches of at most `batch_size`, one
//! upstream request each, and stops once the day's remaining quota is spent.
//! Whatever does not fit is deferred: those entities keep a stale sync point
//! and are picked up by the next invocation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::domain::EntityId;

/// One upstream request worth of entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T = EntityId> {
    pub index: usize,
    pub entities: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<T = EntityId> {
    pub batches: Vec<Batch<T>>,
    /// Entities left for a later run, in their original order.
    pub deferred: Vec<T>,
}

impl<T> Plan<T> {
    /// Requests the plan will spend.
    pub fn requests(&self) -> usize {
        self.batches.len()
    }

    pub fn planned(&self) -> usize {
        self.batches.iter().map(|b| b.entities.len()).sum()
    }

    pub fn quota_exhausted(&self) -> bool {
        !self.deferred.is_empty()
    }
}

/// Partition `entity_ids` into batches without exceeding the remaining quota.
/// Order is preserved across batches and into the deferred tail.
pub fn plan<T: Clone>(entity_ids: &[T], batch_size: usize, daily_quota_remaining: u32) -> Plan<T> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut chunks = entity_ids.chunks(batch_size);

    for chunk in chunks.by_ref().take(daily_quota_remaining as usize) {
        batches.push(Batch {
            index: batches.len(),
            entities: chunk.to_vec(),
        });
    }
    let deferred: Vec<T> = chunks.flatten().cloned().collect();

    if !deferred.is_empty() {
        debug!(
            batches = batches.len(),
            deferred = deferred.len(),
            "quota reached, deferring remainder"
        );
    }
    Plan { batches, deferred }
}

/// Requests allowed per time window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub per_secs: f64,
}

impl RateLimit {
    pub fn new(max_requests: u32, per: Duration) -> Self {
        Self {
            max_requests,
            per_secs: per.as_secs_f64(),
        }
    }

    /// Minimum spacing between two requests.
    pub fn interval(&self) -> Duration {
        if self.max_requests == 0 || !self.per_secs.is_finite() || self.per_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.per_secs / self.max_requests as f64)
    }
}

/// Cooperative self-throttle: call [`Throttle::wait`] before every request.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval(),
            last: None,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            interval: Duration::ZERO,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep until the next request is allowed. The first call never sleeps.
    /// Returns the time slept.
    pub fn wait(&mut self) -> Duration {
        let slept = match self.last {
            Some(last) => {
                let remaining = self.interval.saturating_sub(last.elapsed());
                if !remaining.is_zero() {
                    std::thread::sleep(remaining);
                }
                remaining
            }
            None => Duration::ZERO,
        };
        self.last = Some(Instant::now());
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::new(format!("S{i:03}"))).collect()
    }

    #[test]
    fn partitions_in_order() {
        let p = plan(&ids(7), 3, 10);
        assert_eq!(p.batches.len(), 3);
        assert_eq!(p.batches[2].entities, vec![EntityId::new("S006")]);
        assert_eq!(p.batches[1].index, 1);
        assert!(p.deferred.is_empty());
        assert!(!p.quota_exhausted());
    }

    #[test]
    fn defers_what_quota_cannot_cover() {
        let p = plan(&ids(10), 2, 3);
        assert_eq!(p.requests(), 3);
        assert_eq!(p.planned(), 6);
        assert_eq!(p.deferred, ids(10)[6..].to_vec());
        assert!(p.quota_exhausted());
    }

    #[test]
    fn zero_quota_defers_everything() {
        let p = plan(&ids(4), 2, 0);
        assert!(p.batches.is_empty());
        assert_eq!(p.deferred.len(), 4);
    }

    #[test]
    fn rate_limit_interval() {
        let limit = RateLimit::new(5, Duration::from_secs(60));
        assert_eq!(limit.interval(), Duration::from_secs(12));
        assert_eq!(RateLimit::new(0, Duration::from_secs(1)).interval(), Duration::ZERO);
    }

    #[test]
    fn throttle_spaces_requests() {
        let mut t = Throttle::new(RateLimit::new(1, Duration::from_millis(20)));
        assert_eq!(t.wait(), Duration::ZERO);
        let start = Instant::now();
        t.wait();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
