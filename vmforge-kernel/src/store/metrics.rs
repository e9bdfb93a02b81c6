use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Compteurs légers des opérations du cache store
#[derive(Default)]
pub struct StoreMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub decode_failures: AtomicU64,
    pub operations: AtomicU64,
    pub latency_micros_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub decode_failures: u64,
    pub operations: u64,
    pub avg_latency_micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
    Write,
    Delete,
    Other,
    Failure,
    Timeout,
}

impl StoreMetrics {
    /// N'échoue jamais : les compteurs saturent au lieu de déborder
    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .latency_micros_total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_add(micros)));
        let counter = match outcome {
            Outcome::Hit => &self.hits,
            Outcome::Miss => &self.misses,
            Outcome::Write => &self.writes,
            Outcome::Delete => &self.deletes,
            Outcome::Failure => &self.failures,
            Outcome::Timeout => &self.timeouts,
            Outcome::Other => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let operations = self.operations.load(Ordering::Relaxed);
        let total = self.latency_micros_total.load(Ordering::Relaxed);
        StoreMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            operations,
            avg_latency_micros: if operations == 0 { 0 } else { total / operations },
        }
    }
}
