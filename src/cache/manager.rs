//! Cache hierarchy manager: L1 -> L2 -> loader with promotion, compression,
//! pattern invalidation, and proactive warming.
//!
//! Failure semantics: any L1/L2 backend error is caught here, logged, and
//! treated as a miss: the read falls through to the next tier. Only a
//! loader (L3) failure propagates to the caller.

use crate::cache::codec::CacheCodec;
use crate::cache::entry::CacheEntry;
use crate::cache::l1::L1Cache;
use crate::cache::l2::DistributedCache;
use crate::cache::metrics::{CacheMetrics, MetricsRecorder};
use crate::cache::DataClass;
use crate::config::CacheConfig;
use crate::error::EngineResult;
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{SortKey, WorkflowFilters};
use chrono::Utc;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};

/// Ad hoc warming request, processed highest-priority-first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadRequest {
    pub class: DataClass,
    pub key: String,
    pub priority: u8,
}

impl Ord for PreloadRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for PreloadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Three-level cache hierarchy with an explicit lifecycle
///
/// Constructed once and shared; no ambient global state. `start()` registers
/// the recurring warming job, `flush()` drops L1, `shutdown()` stops the
/// warming scheduler.
pub struct CacheHierarchy {
    config: CacheConfig,
    l1: L1Cache,
    l2: Arc<dyn DistributedCache>,
    codec: Arc<dyn CacheCodec>,
    store: Arc<WorkflowStore>,
    metrics: MetricsRecorder,
    warming: AtomicBool,
    preload: Mutex<BinaryHeap<PreloadRequest>>,
    scheduler: RwLock<Option<JobScheduler>>,
}

impl CacheHierarchy {
    pub fn new(
        config: CacheConfig,
        l2: Arc<dyn DistributedCache>,
        codec: Arc<dyn CacheCodec>,
        store: Arc<WorkflowStore>,
    ) -> Self {
        Self {
            config,
            l1: L1Cache::new(),
            l2,
            codec,
            store,
            metrics: MetricsRecorder::new(),
            warming: AtomicBool::new(false),
            preload: Mutex::new(BinaryHeap::new()),
            scheduler: RwLock::new(None),
        }
    }

    /// Register the recurring warming job if a cron expression is configured
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let Some(cron) = self.config.warm_cron.clone() else {
            return Ok(());
        };

        let scheduler = match JobScheduler::new().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to create warming scheduler: {e}");
                return Ok(());
            }
        };

        let manager = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _scheduler| {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                if let Err(e) = manager.warm().await {
                    tracing::warn!("scheduled cache warming failed: {e}");
                }
            })
        });

        match job {
            Ok(job) => {
                if let Err(e) = scheduler.add(job).await {
                    tracing::warn!("failed to register warming job: {e}");
                } else if let Err(e) = scheduler.start().await {
                    tracing::warn!("failed to start warming scheduler: {e}");
                } else {
                    tracing::info!(cron = %cron, "⏰ cache warming scheduler started");
                    *self.scheduler.write().await = Some(scheduler);
                }
            }
            Err(e) => tracing::warn!("invalid warming cron expression '{cron}': {e}"),
        }

        Ok(())
    }

    /// Drop every L1 entry; L2 and L3 are untouched
    pub fn flush(&self) {
        self.l1.clear();
    }

    /// Stop the warming scheduler and flush L1
    pub async fn shutdown(&self) {
        if let Some(mut scheduler) = self.scheduler.write().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!("warming scheduler shutdown failed: {e}");
            }
        }
        self.flush();
    }

    // ---- read/write path ----

    /// Tiered read: L1, then L2, then the loader against the authoritative
    /// store. A hit at a lower tier is promoted upward with the class TTL.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        class: DataClass,
        key: &str,
        loader: F,
    ) -> EngineResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Option<T>>>,
    {
        let started = Instant::now();

        if let Some(entry) = self.l1.get(class, key) {
            if let Some(value) = self.decode_value::<T>(&entry.payload, entry.compressed) {
                self.metrics.record_l1_hit(started.elapsed().as_micros() as u64);
                return Ok(Some(value));
            }
        }

        let full_key = format!("{}{}", class.key_prefix(), key);

        match self.l2.get(&full_key).await {
            Ok(Some((payload, compressed))) => {
                if let Some(value) = self.decode_value::<T>(&payload, compressed) {
                    // Promote into L1 with this class's TTL
                    let entry =
                        CacheEntry::new(payload, 0, compressed, class.ttl(&self.config));
                    self.l1.insert(class, key, entry);
                    self.metrics.record_l2_hit(started.elapsed().as_micros() as u64);
                    return Ok(Some(value));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %full_key, "L2 read failed, treating as miss: {e}"),
        }

        // Loader failures are the only ones that propagate
        let loaded = loader().await?;

        if let Some(value) = &loaded {
            self.put(class, key, value).await;
        }

        self.metrics.record_miss(started.elapsed().as_micros() as u64);
        Ok(loaded)
    }

    /// Write into L1 and L2. Backend errors are logged, never raised.
    pub async fn put<T: Serialize>(&self, class: DataClass, key: &str, value: &T) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, "failed to serialize cache value: {e}");
                return;
            }
        };

        let (payload, compressed) = self.encode_payload(&raw);
        let ttl = class.ttl(&self.config);

        self.l1.insert(
            class,
            key,
            CacheEntry::new(payload.clone(), raw.len(), compressed, ttl),
        );

        let full_key = format!("{}{}", class.key_prefix(), key);
        let l2_ttl = ttl * self.config.l2_ttl_multiplier.max(1);
        if let Err(e) = self.l2.set_with_ttl(&full_key, &payload, compressed, l2_ttl).await {
            tracing::warn!(key = %full_key, "L2 write failed: {e}");
        }
    }

    /// Remove every entry whose key matches any pattern (substring, or regex
    /// when the pattern compiles). Errors are logged, never raised.
    pub async fn invalidate(&self, patterns: &[String]) {
        for pattern in patterns {
            let regex = Regex::new(pattern).ok();

            let mut removed = 0;
            for class in DataClass::ALL {
                removed += self.l1.remove_matching(class, |key| {
                    key.contains(pattern.as_str())
                        || regex.as_ref().is_some_and(|re| re.is_match(key))
                });
            }

            match self.l2.scan_keys(pattern).await {
                Ok(keys) => {
                    for key in &keys {
                        if let Err(e) = self.l2.delete(key).await {
                            tracing::warn!(key = %key, "L2 delete failed: {e}");
                        }
                    }
                    removed += keys.len();
                }
                Err(e) => tracing::warn!(pattern = %pattern, "L2 scan failed: {e}"),
            }

            tracing::debug!(pattern = %pattern, removed, "cache invalidation pass");
        }
    }

    /// Running aggregates plus per-tier occupancy
    pub async fn metrics(&self) -> CacheMetrics {
        let l1_occupancy = DataClass::ALL
            .iter()
            .map(|class| (class.name().to_string(), self.l1.len(*class)))
            .collect();

        let l2_entries = match self.l2.count().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("L2 count failed: {e}");
                0
            }
        };

        self.metrics.snapshot(l1_occupancy, l2_entries)
    }

    // ---- warming ----

    /// Queue an ad hoc preload, served by the next warming cycle
    pub async fn request_preload(&self, class: DataClass, key: &str, priority: u8) {
        self.preload.lock().await.push(PreloadRequest {
            class,
            key: key.to_string(),
            priority,
        });
    }

    /// Run one warming cycle. A re-entrant call while a cycle is already in
    /// progress is a no-op.
    pub async fn warm(&self) -> EngineResult<()> {
        if self.warming.swap(true, Ordering::SeqCst) {
            tracing::debug!("warming already in progress, skipping");
            return Ok(());
        }

        let started = Instant::now();
        let per_strategy = (self.config.warm_cycle_cap / 4).max(1) as i64;

        let (popular, recent, running, users) = tokio::join!(
            self.warm_most_executed(per_strategy),
            self.warm_recently_executed(per_strategy),
            self.warm_running_executions(per_strategy),
            self.warm_active_user_lists(per_strategy),
        );

        let mut warmed = 0;
        for result in [popular, recent, running, users] {
            match result {
                Ok(n) => warmed += n,
                Err(e) => tracing::warn!("warming strategy failed: {e}"),
            }
        }

        warmed += self.drain_preload_queue().await;

        self.warming.store(false, Ordering::SeqCst);
        tracing::info!(warmed, elapsed = ?started.elapsed(), "🔥 cache warming cycle complete");
        Ok(())
    }

    /// Strategy (a): most-executed active workflows
    async fn warm_most_executed(&self, limit: i64) -> EngineResult<usize> {
        let ids = self.store.most_executed_workflow_ids(limit).await?;
        Ok(self.warm_definitions(&ids).await)
    }

    /// Strategy (b): workflows executed in the last 24 hours
    async fn warm_recently_executed(&self, limit: i64) -> EngineResult<usize> {
        let since = Utc::now() - chrono::Duration::hours(24);
        let ids = self.store.workflows_executed_since(since, limit).await?;
        Ok(self.warm_definitions(&ids).await)
    }

    /// Strategy (c): definitions and contexts for running executions
    async fn warm_running_executions(&self, limit: i64) -> EngineResult<usize> {
        let mut warmed = 0;
        for (execution_id, workflow_id) in self.store.running_executions(limit).await? {
            if let Some((context, _version)) = self.store.load_context(&execution_id).await? {
                self.put(DataClass::Contexts, &execution_id, &context).await;
                warmed += 1;
            }
            warmed += self.warm_definitions(std::slice::from_ref(&workflow_id)).await;
        }
        Ok(warmed)
    }

    /// Strategy (d): workflow lists for users active in the last 2 hours
    async fn warm_active_user_lists(&self, limit: i64) -> EngineResult<usize> {
        let since = Utc::now() - chrono::Duration::hours(2);
        let mut warmed = 0;
        for user_id in self.store.active_user_ids_since(since, limit).await? {
            warmed += self.warm_user_list(&user_id).await;
        }
        Ok(warmed)
    }

    async fn warm_definitions(&self, ids: &[String]) -> usize {
        let mut warmed = 0;
        for id in ids {
            match self.store.get_definition(id, false).await {
                Ok(Some(definition)) => {
                    self.put(DataClass::Definitions, id, &definition).await;
                    warmed += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(workflow_id = %id, "definition warm failed: {e}"),
            }
        }
        warmed
    }

    async fn warm_user_list(&self, user_id: &str) -> usize {
        let filters = default_list_filters(user_id);
        match self.store.list_workflows(&filters).await {
            Ok(page) => {
                self.put(DataClass::UserLists, &filters.signature(), &page).await;
                1
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, "user list warm failed: {e}");
                0
            }
        }
    }

    /// Drain the manual preload queue, highest priority first, bounded by the
    /// per-cycle cap
    async fn drain_preload_queue(&self) -> usize {
        let mut requests = Vec::new();
        {
            let mut queue = self.preload.lock().await;
            while requests.len() < self.config.warm_cycle_cap {
                match queue.pop() {
                    Some(request) => requests.push(request),
                    None => break,
                }
            }
        }

        let mut warmed = 0;
        for request in requests {
            warmed += match request.class {
                DataClass::Definitions => {
                    self.warm_definitions(std::slice::from_ref(&request.key)).await
                }
                DataClass::Contexts => {
                    match self.store.load_context(&request.key).await {
                        Ok(Some((context, _))) => {
                            self.put(DataClass::Contexts, &request.key, &context).await;
                            1
                        }
                        Ok(None) => 0,
                        Err(e) => {
                            tracing::warn!(execution_id = %request.key, "context preload failed: {e}");
                            0
                        }
                    }
                }
                DataClass::UserLists => self.warm_user_list(&request.key).await,
                // Analytics reports are recomputed on demand, nothing to preload
                DataClass::Analytics => 0,
            };
        }
        warmed
    }

    // ---- codec ----

    fn encode_payload(&self, raw: &[u8]) -> (Vec<u8>, bool) {
        if !self.config.compression_enabled || raw.len() < self.config.compression_threshold_bytes {
            return (raw.to_vec(), false);
        }

        match self.codec.encode(raw) {
            Ok(encoded) if encoded.len() < raw.len() => (encoded, true),
            Ok(_) => (raw.to_vec(), false),
            Err(e) => {
                tracing::warn!(codec = self.codec.name(), "payload encode failed: {e}");
                (raw.to_vec(), false)
            }
        }
    }

    /// Decode + deserialize. A codec failure falls back to interpreting the
    /// raw stored bytes; a deserialize failure reads as a miss.
    fn decode_value<T: DeserializeOwned>(&self, payload: &[u8], compressed: bool) -> Option<T> {
        let bytes = if compressed {
            match self.codec.decode(payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(codec = self.codec.name(), "payload decode failed, falling back to raw bytes: {e}");
                    payload.to_vec()
                }
            }
        } else {
            payload.to_vec()
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("cached payload failed to deserialize, treating as miss: {e}");
                None
            }
        }
    }
}

/// Filter signature the warming path shares with the default list read path
pub fn default_list_filters(user_id: &str) -> WorkflowFilters {
    WorkflowFilters {
        user_id: Some(user_id.to_string()),
        statuses: Vec::new(),
        search: None,
        sort: SortKey::UpdatedAt,
        offset: 0,
        limit: 20,
    }
}
