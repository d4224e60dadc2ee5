//! Configuration management for the pulseflow engine.
//!
//! Handles database location, cache tier tuning, rate-limit windows, and
//! warming parameters. Defaults read from environment variables so the same
//! binary works in containers without a config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cache hierarchy configuration
    pub cache: CacheConfig,
    /// Rate limiter configuration
    pub rate_limits: RateLimitConfig,
}

/// Database configuration for the durable workflow store (L3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g., "sqlite:data/pulseflow.db")
    pub url: String,
}

/// Cache hierarchy tuning
///
/// TTLs are tracked per data class so hot execution contexts can expire
/// faster than mostly-static workflow definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for workflow definitions
    pub definition_ttl: Duration,
    /// TTL for execution contexts
    pub context_ttl: Duration,
    /// TTL for per-user workflow lists
    pub user_list_ttl: Duration,
    /// TTL for analytics reports
    pub analytics_ttl: Duration,
    /// Multiplier applied to the class TTL when writing into L2,
    /// so the distributed tier outlives the in-process tier
    pub l2_ttl_multiplier: u32,
    /// Whether payloads pass through the compression codec before storage
    pub compression_enabled: bool,
    /// Minimum serialized size before compression kicks in
    pub compression_threshold_bytes: usize,
    /// Cron expression for recurring warming cycles; None disables the job
    pub warm_cron: Option<String>,
    /// Upper bound on entries loaded per warming cycle
    pub warm_cycle_cap: usize,
}

/// Named rate limiter windows checked by the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Workflow starts allowed per contact per hour
    pub contact_starts_per_hour: u32,
    /// Workflow starts allowed system-wide per minute
    pub system_starts_per_minute: u32,
    /// Messages allowed per contact per hour
    pub contact_messages_per_hour: u32,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("PULSEFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/pulseflow.db".to_string()),
            },
            cache: CacheConfig::default(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            definition_ttl: Duration::from_secs(15 * 60),
            context_ttl: Duration::from_secs(5 * 60),
            user_list_ttl: Duration::from_secs(60),
            analytics_ttl: Duration::from_secs(30 * 60),
            l2_ttl_multiplier: 2,
            compression_enabled: env_flag("PULSEFLOW_CACHE_COMPRESSION", true),
            compression_threshold_bytes: 1024,
            warm_cron: std::env::var("PULSEFLOW_WARM_CRON").ok(),
            warm_cycle_cap: 50,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            contact_starts_per_hour: env_u32("PULSEFLOW_CONTACT_STARTS_PER_HOUR", 20),
            system_starts_per_minute: env_u32("PULSEFLOW_SYSTEM_STARTS_PER_MINUTE", 600),
            contact_messages_per_hour: env_u32("PULSEFLOW_CONTACT_MESSAGES_PER_HOUR", 30),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
