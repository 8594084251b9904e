pub mod cache;
pub mod limiter;
pub mod memory;
pub mod redis_store;
pub mod typed;

pub use cache::{Cache, CacheError, Namespace, DEFAULT_NAMESPACE};
pub use limiter::{
    MemoryRateLimiter, RateLimitDecision, RateLimitStatus, RateLimiter, RedisRateLimiter,
};
pub use memory::MemoryCache;
pub use redis_store::RedisCache;
pub use typed::TypedCache;
