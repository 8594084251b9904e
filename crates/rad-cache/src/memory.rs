use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::cache::{glob_match, Cache, CacheError, Namespace};

const SCAVENGE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process cache: a reader/writer-locked map with a scavenger task that
/// evicts entries past expiration. Reads also check expiry so a stale entry
/// is never served between scavenger ticks.
pub struct MemoryCache {
    ns: Namespace,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    scavenger: JoinHandle<()>,
}

impl MemoryCache {
    pub fn new(ns: Namespace) -> Self {
        let entries: Arc<RwLock<HashMap<String, Entry>>> = Arc::default();
        let scavenger = tokio::spawn(Self::scavenge(entries.clone()));
        Self {
            ns,
            entries,
            scavenger,
        }
    }

    async fn scavenge(entries: Arc<RwLock<HashMap<String, Entry>>>) {
        let mut ticker = time::interval(SCAVENGE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            entries.write().await.retain(|_, entry| entry.expires_at > now);
        }
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.scavenger.abort();
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let key = self.ns.key(key);
        let entries = self.entries.read().await;
        Ok(entries
            .get(&key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let key = self.ns.key(key);
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = self.ns.key(key);
        self.entries.write().await.remove(&key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let pattern = self.ns.key(pattern);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !glob_match(&pattern, key));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn close(&self) {
        self.scavenger.abort();
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache {
        MemoryCache::new(Namespace::default())
    }

    #[tokio::test]
    async fn set_then_get_before_ttl() {
        let cache = cache();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = cache();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_pattern_removes_matching_keys() {
        let cache = cache();
        let ttl = Duration::from_secs(60);
        cache.set("model_cards:skill:a", Bytes::from_static(b"1"), ttl).await.unwrap();
        cache.set("model_cards:skill:b", Bytes::from_static(b"2"), ttl).await.unwrap();
        cache.set("model_cards:project:p", Bytes::from_static(b"3"), ttl).await.unwrap();

        let deleted = cache.delete_pattern("model_cards:skill:*").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(cache.get("model_cards:skill:a").await.unwrap().is_none());
        assert!(cache.get("model_cards:project:p").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn close_clears_everything() {
        let cache = cache();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        cache.close().await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
