use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::KeyStore;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Single-process key store. Every operation runs under one short lock, so
/// check-and-set and increments are atomic with respect to each other.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let current = match entries.get(key) {
            Some(e) if e.is_live(now) => Some(
                e.value
                    .parse::<i64>()
                    .with_context(|| format!("value at {} is not an integer", key))?,
            ),
            _ => None,
        };

        match current {
            Some(v) => {
                let next = v + delta;
                if let Some(e) = entries.get_mut(key) {
                    e.value = next.to_string();
                }
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: delta.to_string(),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self.entries.lock().get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_if_absent_claims_once() {
        let store = MemoryKeyStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_expired_keys_are_invisible_and_reclaimable() {
        let store = MemoryKeyStore::new();

        store
            .set_with_ttl("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store
            .set_if_absent("k", "again", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_incr_keeps_original_ttl_and_counts() {
        let store = MemoryKeyStore::new();
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(store.incr_by("c", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.incr_by("c", 5, ttl).await.unwrap(), 6);
        assert_eq!(store.incr_by("c", -2, None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryKeyStore::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.spawn(async move { store.incr_by("hits", 1, None).await.unwrap() });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(store.get("hits").await.unwrap().as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryKeyStore::new();
        store
            .set_with_ttl("short", "v", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set_with_ttl("long", "v", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
