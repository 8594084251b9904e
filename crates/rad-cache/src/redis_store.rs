use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::cache::{Cache, CacheError, Namespace};

const SCAN_BATCH: usize = 100;

/// Distributed cache over Redis. `delete_pattern` walks an incremental SCAN
/// cursor and deletes in batches so large keyspaces never block the store.
pub struct RedisCache {
    ns: Namespace,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str, ns: Namespace) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        info!(event = "cache_connected", backend = "redis");
        Ok(Self { ns, manager })
    }

    pub fn from_manager(manager: ConnectionManager, ns: Namespace) -> Self {
        Self { ns, manager }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn store_err(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let key = self.ns.key(key);
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(&key).await.map_err(store_err)?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let key = self.ns.key(key);
        let mut conn = self.conn();
        let () = conn
            .set_ex(&key, value.as_ref(), ttl.as_secs().max(1))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = self.ns.key(key);
        let mut conn = self.conn();
        let _: u64 = conn.del(&key).await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let pattern = self.ns.key(pattern);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await.map_err(store_err)?;
                deleted += removed;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Unavailable(format!("unexpected ping reply: {pong}")))
        }
    }

    async fn close(&self) {
        // ConnectionManager has no explicit shutdown; connections drop with it.
    }
}
