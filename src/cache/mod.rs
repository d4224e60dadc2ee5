//! Multi-tier cache hierarchy.
//!
//! Three levels per data class: L1 in-process (lock-free clone-and-swap maps),
//! L2 distributed (trait seam, SQLite-backed by default), L3 the workflow
//! store reached through a loader callback. A hit at level N promotes the
//! value into all lower-numbered levels; any L1/L2 backend error is logged and
//! treated as a miss.

pub mod codec;
pub mod entry;
pub mod l1;
pub mod l2;
pub mod manager;
pub mod metrics;

pub use codec::{CacheCodec, GzipCodec, IdentityCodec};
pub use entry::CacheEntry;
pub use l1::L1Cache;
pub use l2::{DistributedCache, InMemoryCache, SqliteCache};
pub use manager::{CacheHierarchy, PreloadRequest};
pub use metrics::CacheMetrics;

use crate::config::CacheConfig;
use std::time::Duration;

/// Cache data classes, each with its own L1 scope, key prefix, and TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataClass {
    /// Workflow definitions
    Definitions,
    /// Execution context documents
    Contexts,
    /// Per-user workflow list pages
    UserLists,
    /// Analytics reports
    Analytics,
}

impl DataClass {
    pub const ALL: [DataClass; 4] = [
        DataClass::Definitions,
        DataClass::Contexts,
        DataClass::UserLists,
        DataClass::Analytics,
    ];

    /// Namespace prefix applied to keys in L2, where all classes share one
    /// key space
    pub fn key_prefix(&self) -> &'static str {
        match self {
            DataClass::Definitions => "wf:def:",
            DataClass::Contexts => "wf:ctx:",
            DataClass::UserLists => "wf:list:",
            DataClass::Analytics => "wf:stats:",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataClass::Definitions => "definitions",
            DataClass::Contexts => "contexts",
            DataClass::UserLists => "user_lists",
            DataClass::Analytics => "analytics",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            DataClass::Definitions => 0,
            DataClass::Contexts => 1,
            DataClass::UserLists => 2,
            DataClass::Analytics => 3,
        }
    }

    /// Configured TTL for this class
    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        match self {
            DataClass::Definitions => config.definition_ttl,
            DataClass::Contexts => config.context_ttl,
            DataClass::UserLists => config.user_list_ttl,
            DataClass::Analytics => config.analytics_ttl,
        }
    }
}
