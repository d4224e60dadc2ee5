//! Cache entry wrapper carrying payload bytes and access statistics.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One cached value as stored in L1
///
/// The payload holds the serialized (and possibly compressed) bytes. Access
/// statistics live behind shared atomics so reads can touch the entry without
/// swapping the containing map. Entries expire by TTL or explicit
/// invalidation; they are never persisted beyond their tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Arc<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub compressed: bool,
    /// Serialized size before compression
    pub size: usize,
    access_count: Arc<AtomicU64>,
    last_access_ms: Arc<AtomicI64>,
}

impl CacheEntry {
    pub fn new(payload: Vec<u8>, size: usize, compressed: bool, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            payload: Arc::new(payload),
            created_at: now,
            ttl,
            compressed,
            size,
            access_count: Arc::new(AtomicU64::new(0)),
            last_access_ms: Arc::new(AtomicI64::new(now.timestamp_millis())),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= self.ttl.as_millis() as i64
    }

    /// Record a read without mutating the containing map
    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }
}
