//! Sliding-window rate limiting over a shared store. The distributed store
//! is authoritative — no local count caching — so admission stays correct
//! when the gateway scales horizontally.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::cache::{CacheError, Namespace};

/// Ceiling on one limiter round-trip.
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitStatus {
    pub count: u64,
    pub reset_after: Duration,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, CacheError>;

    async fn status(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateLimitStatus, CacheError>;

    async fn reset(&self, key: &str) -> Result<(), CacheError>;
}

fn limiter_key(ns: &Namespace, key: &str) -> String {
    ns.key(&format!("ratelimit:{key}"))
}

/// Sorted-set sliding window: members scored by nanosecond timestamp, the
/// prune + count + add + expire sequence executed as one MULTI/EXEC.
pub struct RedisRateLimiter {
    ns: Namespace,
    manager: ConnectionManager,
}

impl RedisRateLimiter {
    pub fn new(manager: ConnectionManager, ns: Namespace) -> Self {
        Self { ns, manager }
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        Ok(entries.first().map(|(_, score)| *score))
    }
}

fn now_ns() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

fn reset_from_oldest(oldest: Option<i64>, window: Duration, now: i64) -> Duration {
    match oldest {
        Some(oldest) => {
            let reset_at = oldest + window.as_nanos() as i64;
            Duration::from_nanos(reset_at.saturating_sub(now).max(0) as u64)
        }
        None => Duration::ZERO,
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, CacheError> {
        let key = limiter_key(&self.ns, key);
        let now = now_ns();
        let min_score = now - window.as_nanos() as i64;
        let member = format!("{now}-{}", uuid::Uuid::new_v4().simple());
        let mut conn = self.manager.clone();

        let query = async {
            let (_removed, count, _added, _expired): (u64, u64, u64, u64) = redis::pipe()
                .atomic()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(min_score)
                .cmd("ZCARD")
                .arg(&key)
                .cmd("ZADD")
                .arg(&key)
                .arg(now)
                .arg(&member)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(window.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::Unavailable(err.to_string()))?;
            Ok::<u64, CacheError>(count)
        };
        let count = tokio::time::timeout(CALL_TIMEOUT, query)
            .await
            .map_err(|_| CacheError::Unavailable("rate limiter timed out".to_string()))??;

        let allowed = count < max_requests;
        let remaining = max_requests.saturating_sub(count + 1);
        let reset_after = if allowed {
            window
        } else {
            reset_from_oldest(self.oldest_score(&key).await?, window, now)
        };
        Ok(RateLimitDecision {
            allowed,
            limit: max_requests,
            remaining,
            reset_after,
        })
    }

    async fn status(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateLimitStatus, CacheError> {
        let key = limiter_key(&self.ns, key);
        let now = now_ns();
        let min_score = now - window.as_nanos() as i64;
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(&key)
            .arg(min_score)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let reset_after = reset_from_oldest(self.oldest_score(&key).await?, window, now);
        Ok(RateLimitStatus { count, reset_after })
    }

    async fn reset(&self, key: &str) -> Result<(), CacheError> {
        let key = limiter_key(&self.ns, key);
        let mut conn = self.manager.clone();
        let _: u64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

/// In-process sliding window for tests and cache-less deployments. Same
/// admission semantics, no cross-instance coordination.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, CacheError> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let entries = windows.entry(key.to_string()).or_default();
        while entries
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            entries.pop_front();
        }
        let count = entries.len() as u64;
        let allowed = count < max_requests;
        entries.push_back(now);
        let reset_after = if allowed {
            window
        } else {
            entries
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(Duration::ZERO)
        };
        Ok(RateLimitDecision {
            allowed,
            limit: max_requests,
            remaining: max_requests.saturating_sub(count + 1),
            reset_after,
        })
    }

    async fn status(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<RateLimitStatus, CacheError> {
        let now = Instant::now();
        let windows = self
            .windows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let (count, reset_after) = windows
            .get(key)
            .map(|entries| {
                let live = entries
                    .iter()
                    .filter(|at| now.duration_since(**at) < window)
                    .count() as u64;
                let reset = entries
                    .iter()
                    .find(|at| now.duration_since(**at) < window)
                    .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or(Duration::ZERO);
                (live, reset)
            })
            .unwrap_or((0, Duration::ZERO));
        Ok(RateLimitStatus { count, reset_after })
    }

    async fn reset(&self, key: &str) -> Result<(), CacheError> {
        self.windows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn boundary_mth_admitted_mplus1th_denied() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..3 {
            let decision = limiter.check("k", 3, WINDOW).await.unwrap();
            assert!(decision.allowed);
        }
        let denied = limiter.check("k", 3, WINDOW).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_after <= WINDOW);
    }

    #[tokio::test]
    async fn window_slides_and_readmits() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("k", 3, WINDOW).await.unwrap().allowed);
        }
        // Half a window later the original entries still count.
        tokio::time::sleep(WINDOW / 2).await;
        assert!(!limiter.check("k", 3, WINDOW).await.unwrap().allowed);
        // Past the window the t=0 entries age out.
        tokio::time::sleep(WINDOW / 2 + Duration::from_millis(20)).await;
        assert!(limiter.check("k", 3, WINDOW).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = MemoryRateLimiter::new();
        assert!(limiter.check("a", 1, WINDOW).await.unwrap().allowed);
        assert!(!limiter.check("a", 1, WINDOW).await.unwrap().allowed);
        assert!(limiter.check("b", 1, WINDOW).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let limiter = MemoryRateLimiter::new();
        assert!(limiter.check("k", 1, WINDOW).await.unwrap().allowed);
        assert!(!limiter.check("k", 1, WINDOW).await.unwrap().allowed);
        limiter.reset("k").await.unwrap();
        assert!(limiter.check("k", 1, WINDOW).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn status_reports_live_count() {
        let limiter = MemoryRateLimiter::new();
        limiter.check("k", 10, WINDOW).await.unwrap();
        limiter.check("k", 10, WINDOW).await.unwrap();
        let status = limiter.status("k", WINDOW).await.unwrap();
        assert_eq!(status.count, 2);
        assert!(status.reset_after <= WINDOW);
    }
}
