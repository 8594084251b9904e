use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use rad_cache::{MemoryCache, MemoryRateLimiter, Namespace, TypedCache};
use rad_common::GatewayError;
use rad_core::{EngineDeps, EngineResponse, GatewayConfig, GatewayEngine, UsageAggregator};
use rad_provider_core::{
    AdapterRegistry, ApiKeyInfo, ApiType, CircuitConfig, CircuitRegistry, CostTracker, EventHub,
    HealthTracker, MemoryApiKeyRepository, MemoryUsageRepository, PricingTable, RateLimit,
};
use rad_provider_impl::MockAdapter;

fn test_config() -> GatewayConfig {
    use clap::Parser;
    GatewayConfig::try_parse_from(["rad-gateway"]).unwrap()
}

struct Harness {
    engine: GatewayEngine,
    usage: Arc<MemoryUsageRepository>,
    keys: Arc<MemoryApiKeyRepository>,
}

fn harness() -> Harness {
    let pricing = Arc::new(PricingTable::builtin());
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::new(pricing.clone())));
    let providers = registry.names();

    let hub = EventHub::new(64, 16);
    let health = Arc::new(HealthTracker::new(&providers));
    let circuits = CircuitRegistry::new(&providers, CircuitConfig::default(), hub.clone());
    let keys = Arc::new(MemoryApiKeyRepository::new());
    let usage_repo = Arc::new(MemoryUsageRepository::new());
    let (usage, _handle) = UsageAggregator::spawn(hub.clone(), usage_repo.clone());

    let engine = GatewayEngine::new(EngineDeps {
        config: test_config(),
        registry,
        circuits,
        health,
        hub,
        cache: Some(TypedCache::new(Arc::new(MemoryCache::new(
            Namespace::default(),
        )))),
        limiter: Arc::new(MemoryRateLimiter::new()),
        keys: keys.clone(),
        usage,
        pricing,
        cost: Arc::new(CostTracker::new()),
    });
    Harness {
        engine,
        usage: usage_repo,
        keys,
    }
}

fn seed_key(harness: &Harness, raw_key: &str, rate_limit: Option<RateLimit>) {
    let hash = blake3::hash(raw_key.as_bytes()).to_hex().to_string();
    harness.keys.insert(ApiKeyInfo {
        name: "test-key".to_string(),
        key_hash: hash,
        project_id: Some("p1".to_string()),
        role: None,
        rate_limit,
        valid: true,
        expires_at: None,
    });
}

#[tokio::test]
async fn authenticates_and_caches_known_keys() {
    let harness = harness();
    seed_key(&harness, "sk-test", None);

    let principal = harness.engine.authenticate("sk-test").await.unwrap();
    assert_eq!(principal.key_name, "test-key");
    assert_eq!(principal.project_id.as_deref(), Some("p1"));

    assert!(matches!(
        harness.engine.authenticate("sk-wrong").await,
        Err(GatewayError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn disabled_key_is_forbidden() {
    let harness = harness();
    let hash = blake3::hash(b"sk-disabled").to_hex().to_string();
    harness.keys.insert(ApiKeyInfo {
        name: "dead".to_string(),
        key_hash: hash,
        project_id: None,
        role: None,
        rate_limit: None,
        valid: false,
        expires_at: None,
    });
    assert!(matches!(
        harness.engine.authenticate("sk-disabled").await,
        Err(GatewayError::Forbidden(_))
    ));
}

#[tokio::test]
async fn expired_key_is_rejected() {
    let harness = harness();
    let hash = blake3::hash(b"sk-expired").to_hex().to_string();
    harness.keys.insert(ApiKeyInfo {
        name: "old".to_string(),
        key_hash: hash,
        project_id: None,
        role: None,
        rate_limit: None,
        valid: true,
        expires_at: Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)),
    });
    assert!(matches!(
        harness.engine.authenticate("sk-expired").await,
        Err(GatewayError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn per_key_rate_limit_is_enforced() {
    let harness = harness();
    seed_key(
        &harness,
        "sk-limited",
        Some(RateLimit {
            max_requests: 2,
            window_secs: 60,
        }),
    );
    let principal = harness.engine.authenticate("sk-limited").await.unwrap();

    assert!(harness.engine.admit(&principal).await.is_ok());
    assert!(harness.engine.admit(&principal).await.is_ok());
    let denied = harness.engine.admit(&principal).await;
    let Err(GatewayError::RateLimited { limit, .. }) = denied else {
        panic!("expected rate limit, got {denied:?}");
    };
    assert_eq!(limit, 2);
}

#[tokio::test]
async fn non_streaming_request_returns_json_and_accounts_usage() {
    let harness = harness();
    seed_key(&harness, "sk-test", None);
    let principal = harness.engine.authenticate("sk-test").await.unwrap();

    let response = harness
        .engine
        .execute(
            &principal,
            ApiType::Chat,
            json!({
                "model": "mock-small",
                "messages": [{"role": "user", "content": "ping"}],
            }),
            false,
            "trace-1".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let EngineResponse::Json(body) = response else {
        panic!("expected json response");
    };
    assert_eq!(body["model"], "mock-small");
    assert_eq!(body["choices"][0]["message"]["content"], "echo: ping");

    // The aggregator hands records to the repository asynchronously.
    timeout(Duration::from_secs(2), async {
        loop {
            if !harness.usage.records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("usage record must land");
    let records = harness.usage.records();
    assert_eq!(records[0].provider, "mock");
    assert_eq!(records[0].response_status, "success");
    assert_eq!(records[0].trace_id, "trace-1");
    assert!(records[0].total_tokens > 0);
}

#[tokio::test]
async fn streaming_request_yields_sse_frames_with_done() {
    let harness = harness();
    seed_key(&harness, "sk-test", None);
    let principal = harness.engine.authenticate("sk-test").await.unwrap();

    let response = harness
        .engine
        .execute(
            &principal,
            ApiType::Chat,
            json!({
                "model": "mock-small",
                "messages": [{"role": "user", "content": "stream me"}],
            }),
            true,
            "trace-2".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let EngineResponse::Stream { mut body } = response else {
        panic!("expected stream response");
    };
    let mut all = Vec::new();
    while let Some(frame) = timeout(Duration::from_secs(2), body.recv()).await.unwrap() {
        all.extend_from_slice(&frame);
    }
    let text = String::from_utf8(all).unwrap();
    assert!(text.contains("event: message\ndata: "));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let harness = harness();
    seed_key(&harness, "sk-test", None);
    let principal = harness.engine.authenticate("sk-test").await.unwrap();

    let result = harness
        .engine
        .execute(
            &principal,
            ApiType::Chat,
            json!({"model": "weird-model-9", "messages": []}),
            false,
            "trace-3".to_string(),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(GatewayError::UnknownProvider(_))));
}

#[tokio::test]
async fn provider_prefix_routes_explicitly() {
    let harness = harness();
    seed_key(&harness, "sk-test", None);
    let principal = harness.engine.authenticate("sk-test").await.unwrap();

    let response = harness
        .engine
        .execute(
            &principal,
            ApiType::Chat,
            json!({
                "model": "mock/gpt-like",
                "messages": [{"role": "user", "content": "hi"}],
            }),
            false,
            "trace-4".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let EngineResponse::Json(body) = response else {
        panic!("expected json response");
    };
    // The provider prefix is stripped before the adapter sees the model.
    assert_eq!(body["model"], "gpt-like");
}
