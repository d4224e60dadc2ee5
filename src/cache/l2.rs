//! Distributed L2 cache seam.
//!
//! The hierarchy only needs get / set-with-ttl / delete / pattern-scan, so
//! any shared store can sit here. The default implementation keeps entries in
//! a SQLite table reachable by every process on the node; tests use the
//! in-memory variant.

use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// A payload as stored in L2: bytes plus the compressed flag
pub type StoredPayload = (Vec<u8>, bool);

/// Distributed cache store contract
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<StoredPayload>>;

    async fn set_with_ttl(
        &self,
        key: &str,
        payload: &[u8],
        compressed: bool,
        ttl: Duration,
    ) -> EngineResult<()>;

    async fn delete(&self, key: &str) -> EngineResult<()>;

    /// Keys containing the given fragment (substring semantics)
    async fn scan_keys(&self, fragment: &str) -> EngineResult<Vec<String>>;

    /// Number of live entries, for occupancy metrics
    async fn count(&self) -> EngineResult<u64>;
}

/// SQLite-backed L2 store
#[derive(Debug, Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the cache table. Safe to call multiple times.
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn expiry(ttl: Duration) -> String {
        (Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)).to_rfc3339()
    }
}

#[async_trait]
impl DistributedCache for SqliteCache {
    async fn get(&self, key: &str) -> EngineResult<Option<StoredPayload>> {
        let row = sqlx::query("SELECT payload, compressed, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: String = row.get("expires_at");
        let expired = DateTime::parse_from_rfc3339(&expires_at)
            .map(|t| t.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(true);

        if expired {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        Ok(Some((row.get("payload"), row.get::<i64, _>("compressed") != 0)))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        payload: &[u8],
        compressed: bool,
        ttl: Duration,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, payload, compressed, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                compressed = excluded.compressed,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(compressed as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_keys(&self, fragment: &str) -> EngineResult<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM cache_entries WHERE key LIKE ?")
            .bind(format!("%{fragment}%"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }

    async fn count(&self) -> EngineResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries WHERE expires_at > ?")
            .bind(Utc::now().to_rfc3339())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

/// In-memory L2 used by tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (Vec<u8>, bool, DateTime<Utc>)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedCache for InMemoryCache {
    async fn get(&self, key: &str) -> EngineResult<Option<StoredPayload>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(payload, compressed, expires)| {
            (*expires > Utc::now()).then(|| (payload.clone(), *compressed))
        }))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        payload: &[u8],
        compressed: bool,
        ttl: Duration,
    ) -> EngineResult<()> {
        let expires = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (payload.to_vec(), compressed, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, fragment: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.contains(fragment))
            .cloned()
            .collect())
    }

    async fn count(&self) -> EngineResult<u64> {
        let now = Utc::now();
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|(_, _, expires)| *expires > now)
            .count() as u64)
    }
}
