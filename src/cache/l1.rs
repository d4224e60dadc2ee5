//! In-process L1 cache: one lock-free map per data class.
//!
//! Uses ArcSwap clone-and-swap maps so reads never block and writers swap the
//! entire map pointer atomically. Concurrent executions keep reading the old
//! map while a write publishes the new one.

use crate::cache::entry::CacheEntry;
use crate::cache::DataClass;
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

type EntryMap = HashMap<String, CacheEntry>;

/// Four independently scoped in-process caches, indexed by data class
#[derive(Debug)]
pub struct L1Cache {
    scopes: [ArcSwap<EntryMap>; 4],
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl L1Cache {
    pub fn new() -> Self {
        Self {
            scopes: std::array::from_fn(|_| ArcSwap::new(Arc::new(HashMap::new()))),
        }
    }

    fn scope(&self, class: DataClass) -> &ArcSwap<EntryMap> {
        &self.scopes[class.index()]
    }

    /// Lock-free read. Expired entries read as misses; they are swept out
    /// lazily by the next write to the same scope.
    pub fn get(&self, class: DataClass, key: &str) -> Option<CacheEntry> {
        let map = self.scope(class).load();
        let entry = map.get(key)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        entry.touch();
        Some(entry.clone())
    }

    /// Insert via clone-and-swap, sweeping expired entries on the way
    pub fn insert(&self, class: DataClass, key: &str, entry: CacheEntry) {
        let now = Utc::now();
        self.scope(class).rcu(|current| {
            let mut next: EntryMap = current
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            next.insert(key.to_string(), entry.clone());
            Arc::new(next)
        });
    }

    /// Remove every key the predicate matches; returns how many were dropped
    pub fn remove_matching<F>(&self, class: DataClass, matches: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        self.scope(class).rcu(|current| {
            let next: EntryMap = current
                .iter()
                .filter(|(k, _)| !matches(k))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            removed = current.len() - next.len();
            Arc::new(next)
        });
        removed
    }

    pub fn len(&self, class: DataClass) -> usize {
        self.scope(class).load().len()
    }

    pub fn is_empty(&self, class: DataClass) -> bool {
        self.len(class) == 0
    }

    /// Drop every entry in every scope
    pub fn clear(&self) {
        for class in DataClass::ALL {
            self.scope(class).store(Arc::new(HashMap::new()));
        }
    }
}
