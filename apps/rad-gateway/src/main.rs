use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rad_cache::{
    MemoryCache, MemoryRateLimiter, Namespace, RateLimiter, RedisCache, RedisRateLimiter,
    TypedCache,
};
use rad_core::{EngineDeps, GatewayConfig, GatewayEngine, UsageAggregator};
use rad_provider_core::{
    AdapterRegistry, AdminEvent, ApiKeyInfo, CircuitConfig, CircuitRegistry, CostTracker,
    EventHub, HealthSnapshot, HealthTracker, MemoryApiKeyRepository, MemoryUsageRepository,
    PricingTable,
};
use rad_provider_impl::{AnthropicAdapter, GeminiAdapter, MockAdapter, OpenAIAdapter, RetryPolicy};

const HEALTH_EMIT_INTERVAL: Duration = Duration::from_secs(15);
const HUB_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::parse();
    config
        .validate()
        .context("configuration rejected at startup")?;

    let engine = bootstrap(&config).await?;
    let app = rad_router::gateway_router(engine);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.listen))?;
    info!(event = "listening", addr = %config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!(event = "shutdown_complete");
    Ok(())
}

async fn bootstrap(config: &GatewayConfig) -> Result<GatewayEngine> {
    let pricing = Arc::new(PricingTable::builtin());
    let retry = RetryPolicy {
        max_retries: config.max_retries,
        ..RetryPolicy::default()
    };
    let upstream_timeout = config.upstream_timeout();

    let mut registry = AdapterRegistry::new();
    if let Some(key) = &config.openai_api_key {
        let mut adapter = OpenAIAdapter::new(key.clone(), pricing.clone())
            .with_retry(retry)
            .with_timeout(upstream_timeout);
        if let Some(base) = &config.openai_base_url {
            adapter = adapter.with_base_url(base.clone());
        }
        registry.register(Arc::new(adapter));
    }
    if let Some(key) = &config.anthropic_api_key {
        let mut adapter = AnthropicAdapter::new(key.clone(), pricing.clone())
            .with_retry(retry)
            .with_timeout(upstream_timeout);
        if let Some(base) = &config.anthropic_base_url {
            adapter = adapter.with_base_url(base.clone());
        }
        registry.register(Arc::new(adapter));
    }
    if let Some(key) = &config.gemini_api_key {
        let mut adapter = GeminiAdapter::new(key.clone(), pricing.clone())
            .with_retry(retry)
            .with_timeout(upstream_timeout);
        if let Some(base) = &config.gemini_base_url {
            adapter = adapter.with_base_url(base.clone());
        }
        registry.register(Arc::new(adapter));
    }
    if !config.production {
        registry.register(Arc::new(MockAdapter::new(pricing.clone())));
    }
    let providers = registry.names();
    if providers.is_empty() {
        bail!("no upstream providers configured; set at least one provider api key");
    }
    info!(event = "providers_enabled", providers = ?providers);

    let hub = EventHub::new(HUB_BUFFER, config.admin_subscribers);
    let health = Arc::new(HealthTracker::new(&providers));
    let circuits = CircuitRegistry::new(&providers, CircuitConfig::default(), hub.clone());
    spawn_health_emitter(hub.clone(), health.clone());

    let namespace = Namespace::new(config.cache_prefix.clone());
    let (cache, limiter): (TypedCache, Arc<dyn RateLimiter>) = match &config.redis_url {
        Some(url) => {
            // A configured store is a required dependency: refuse to start
            // half-connected rather than silently degrade.
            let client = redis::Client::open(url.as_str()).context("invalid redis url")?;
            let manager = redis::aio::ConnectionManager::new(client)
                .await
                .context("redis unreachable")?;
            let cache = RedisCache::from_manager(manager.clone(), namespace.clone());
            let limiter = RedisRateLimiter::new(manager, namespace);
            (TypedCache::new(Arc::new(cache)), Arc::new(limiter))
        }
        None => {
            info!(event = "cache_fallback", backend = "memory");
            let cache = MemoryCache::new(namespace);
            (
                TypedCache::new(Arc::new(cache)),
                Arc::new(MemoryRateLimiter::new()),
            )
        }
    };

    let keys = Arc::new(MemoryApiKeyRepository::new());
    if let Some(dev_key) = &config.dev_api_key {
        keys.insert(ApiKeyInfo {
            name: "dev".to_string(),
            key_hash: blake3::hash(dev_key.as_bytes()).to_hex().to_string(),
            project_id: None,
            role: None,
            rate_limit: None,
            valid: true,
            expires_at: None,
        });
        info!(event = "dev_key_seeded");
    }
    let usage_repo = Arc::new(MemoryUsageRepository::new());
    let (usage, _usage_task) = UsageAggregator::spawn(hub.clone(), usage_repo);

    Ok(GatewayEngine::new(EngineDeps {
        config: config.clone(),
        registry,
        circuits,
        health,
        hub,
        cache: Some(cache),
        limiter,
        keys,
        usage,
        pricing,
        cost: Arc::new(CostTracker::new()),
    }))
}

fn spawn_health_emitter(hub: EventHub, health: Arc<HealthTracker>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_EMIT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            hub.emit(AdminEvent::ProviderHealth(HealthSnapshot {
                providers: health.snapshot(),
            }));
        }
    });
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the task is aborted.
        std::future::pending::<()>().await;
    }
    info!(event = "shutdown_requested");
}
