//! Service Metrics
//!
//! Lock-free counters aggregated across the service facade, exposed as a
//! serializable snapshot for health endpoints and tests.

use crate::cache::CacheSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Facade-level counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    reads_total: AtomicU64,
    writes_total: AtomicU64,
    throttled_total: AtomicU64,
    errors_total: AtomicU64,
    latency_us_sum: AtomicU64,
    latency_count: AtomicU64,
}

impl ServiceMetrics {
    pub fn record_read(&self, latency: Duration) {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Latency here is accept latency: queued writes complete asynchronously.
    pub fn record_write(&self, latency: Duration) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_throttled(&self) {
        self.throttled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        self.latency_us_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: CacheSnapshot) -> MetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum_us = self.latency_us_sum.load(Ordering::Relaxed);
        let lookups = cache.hits + cache.misses;
        let reads = self.reads_total.load(Ordering::Relaxed);
        let writes = self.writes_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            operations_total: reads + writes,
            reads_total: reads,
            writes_total: writes,
            throttled_total: self.throttled_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            avg_latency_ms: if count == 0 {
                0.0
            } else {
                sum_us as f64 / count as f64 / 1000.0
            },
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            cache_entries: cache.size,
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                cache.hits as f64 / lookups as f64
            },
        }
    }
}

/// Point-in-time metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Accepted reads plus accepted writes.
    pub operations_total: u64,
    pub reads_total: u64,
    pub writes_total: u64,
    pub throttled_total: u64,
    pub errors_total: u64,
    /// Average read latency / write accept latency, milliseconds.
    pub avg_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_entries: usize,
    pub cache_hit_ratio: f64,
}
