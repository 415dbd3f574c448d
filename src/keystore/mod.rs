//! Key/value store with TTLs and atomic counters.
//!
//! Backs the campaign cache version, idempotency keys, fraud quota and
//! per-IP score cache, and hourly pacing counters.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use std::time::Duration;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only when the key is absent (or expired). Returns true when this call set it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically add `delta` and return the new value. `ttl` applies only when the key is created.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Read an integer counter, treating a missing key as zero.
pub async fn get_counter(store: &dyn KeyStore, key: &str) -> Result<i64> {
    Ok(store
        .get(key)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0))
}
