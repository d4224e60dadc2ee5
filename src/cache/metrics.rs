//! Running cache metrics, updated on every read. Never persisted.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomics-backed running aggregates
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    reads: AtomicU64,
    total_latency_us: AtomicU64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self, latency_us: u64) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
        self.record_hit(latency_us);
    }

    pub fn record_l2_hit(&self, latency_us: u64) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
        self.record_hit(latency_us);
    }

    fn record_hit(&self, latency_us: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_read(latency_us);
    }

    pub fn record_miss(&self, latency_us: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_read(latency_us);
    }

    fn record_read(&self, latency_us: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        l1_occupancy: HashMap<String, usize>,
        l2_entries: u64,
    ) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = self.reads.load(Ordering::Relaxed);
        let total = (hits + misses).max(1) as f64;

        CacheMetrics {
            hits,
            misses,
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            hit_rate: hits as f64 / total,
            miss_rate: misses as f64 / total,
            avg_latency_ms: if reads == 0 {
                0.0
            } else {
                self.total_latency_us.load(Ordering::Relaxed) as f64 / reads as f64 / 1000.0
            },
            l1_occupancy,
            l2_entries,
        }
    }
}

/// Point-in-time metrics snapshot returned by the hierarchy
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_latency_ms: f64,
    /// Live entries per L1 data class
    pub l1_occupancy: HashMap<String, usize>,
    pub l2_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_reflect_recorded_reads() {
        let recorder = MetricsRecorder::new();
        recorder.record_l1_hit(100);
        recorder.record_l2_hit(500);
        recorder.record_miss(2000);

        let snapshot = recorder.snapshot(HashMap::new(), 0);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.avg_latency_ms - 2600.0 / 3.0 / 1000.0).abs() < 1e-9);
    }
}
