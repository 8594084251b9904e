use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rad_cache::{RateLimitDecision, RateLimiter, TypedCache};
use rad_common::{new_request_id, GatewayError};
use rad_protocol::chunk::ChunkUsage;
use rad_provider_core::{
    AdapterRegistry, ApiKeyInfo, ApiKeyRepository, ApiType, CircuitRegistry, CostTracker,
    EventHub, HealthTracker, PricingTable, ProviderHealth, ProviderRequest, RateLimit,
    ResultPayload, UsageRecord,
};
use rad_transform::anthropic::AnthropicStream;
use rad_transform::gemini::GeminiStream;
use rad_transform::openai::OpenAIStream;
use rad_transform::StreamTransformer;

use crate::config::GatewayConfig;
use crate::gate::StreamGate;
use crate::orchestrator::{StreamOrchestrator, StreamStats};
use crate::pipe::StreamPipe;
use crate::usage::UsageAggregator;
use crate::writer::ClientWriter;

/// Authenticated caller identity threaded from the auth gate into
/// accounting.
#[derive(Debug, Clone)]
pub struct Principal {
    pub key_name: String,
    pub key_hash: String,
    pub project_id: Option<String>,
    pub rate_limit: Option<RateLimit>,
}

pub struct EngineDeps {
    pub config: GatewayConfig,
    pub registry: AdapterRegistry,
    pub circuits: CircuitRegistry,
    pub health: Arc<HealthTracker>,
    pub hub: EventHub,
    pub cache: Option<TypedCache>,
    pub limiter: Arc<dyn RateLimiter>,
    pub keys: Arc<dyn ApiKeyRepository>,
    pub usage: UsageAggregator,
    pub pricing: Arc<PricingTable>,
    pub cost: Arc<CostTracker>,
}

struct EngineInner {
    config: ArcSwap<GatewayConfig>,
    registry: AdapterRegistry,
    circuits: CircuitRegistry,
    health: Arc<HealthTracker>,
    hub: EventHub,
    cache: Option<TypedCache>,
    limiter: Arc<dyn RateLimiter>,
    keys: Arc<dyn ApiKeyRepository>,
    usage: UsageAggregator,
    pricing: Arc<PricingTable>,
    cost: Arc<CostTracker>,
    gate: StreamGate,
}

pub enum EngineResponse {
    Json(JsonValue),
    /// SSE body frames, already serialized.
    Stream { body: mpsc::Receiver<Bytes> },
}

#[derive(Clone)]
pub struct GatewayEngine {
    inner: Arc<EngineInner>,
}

impl GatewayEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let gate = StreamGate::new(deps.config.max_streams);
        Self {
            inner: Arc::new(EngineInner {
                config: ArcSwap::from_pointee(deps.config),
                registry: deps.registry,
                circuits: deps.circuits,
                health: deps.health,
                hub: deps.hub,
                cache: deps.cache,
                limiter: deps.limiter,
                keys: deps.keys,
                usage: deps.usage,
                pricing: deps.pricing,
                cost: deps.cost,
                gate,
            }),
        }
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.inner.config.load_full()
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.inner.health.snapshot()
    }

    pub fn active_streams(&self) -> usize {
        self.inner.gate.active()
    }

    /// Admin bearer tokens are compared by hash, never logged.
    pub fn verify_admin_token(&self, presented: &str) -> bool {
        let config = self.config();
        let Some(expected) = config.admin_token.as_deref() else {
            return false;
        };
        blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes())
    }

    pub async fn authenticate(&self, presented_key: &str) -> Result<Principal, GatewayError> {
        let hash = blake3::hash(presented_key.as_bytes()).to_hex().to_string();
        let now = OffsetDateTime::now_utc();

        if let Some(cache) = &self.inner.cache {
            match cache.api_key(&hash).await {
                Ok(Some(info)) => return principal_from(info, now),
                Ok(None) => {}
                Err(err) => {
                    // Degrade to repository-only.
                    warn!(event = "auth_cache_unavailable", error = %err);
                }
            }
        }

        let info = self
            .inner
            .keys
            .find_by_hash(&hash)
            .await
            .map_err(|err| GatewayError::Internal(format!("key lookup failed: {err}")))?
            .ok_or_else(|| GatewayError::Unauthenticated("unknown api key".to_string()))?;

        if let Some(cache) = &self.inner.cache
            && let Err(err) = cache.put_api_key(&info).await
        {
            warn!(event = "auth_cache_unavailable", error = %err);
        }
        principal_from(info, now)
    }

    /// Sliding-window admission for one principal. The store is
    /// authoritative; when it is unreachable the gateway fails open and
    /// logs, preferring liveness over strict limits.
    pub async fn admit(&self, principal: &Principal) -> Result<RateLimitDecision, GatewayError> {
        let config = self.config();
        let (max_requests, window) = principal
            .rate_limit
            .map(|limit| (limit.max_requests, Duration::from_secs(limit.window_secs)))
            .unwrap_or((config.rate_limit_max, config.rate_limit_window()));
        let key = format!("key:{}", principal.key_hash);
        match self.inner.limiter.check(&key, max_requests, window).await {
            Ok(decision) if decision.allowed => Ok(decision),
            Ok(decision) => Err(GatewayError::RateLimited {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_after: decision.reset_after,
            }),
            Err(err) => {
                warn!(event = "rate_limiter_unavailable", error = %err);
                Ok(RateLimitDecision {
                    allowed: true,
                    limit: max_requests,
                    remaining: max_requests,
                    reset_after: window,
                })
            }
        }
    }

    fn route(&self, model: &str) -> Result<(String, String), GatewayError> {
        if let Some((provider, rest)) = model.split_once('/') {
            return if self.inner.registry.get(provider).is_some() {
                Ok((provider.to_string(), rest.to_string()))
            } else {
                Err(GatewayError::UnknownProvider(provider.to_string()))
            };
        }

        let config = self.config();
        let inferred = if model.starts_with("gpt-")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("text-embedding")
            || model.starts_with("dall-e")
            || model.starts_with("whisper")
        {
            Some("openai")
        } else if model.starts_with("claude") {
            Some("anthropic")
        } else if model.starts_with("gemini") {
            Some("gemini")
        } else if model.starts_with("mock") {
            Some("mock")
        } else {
            config.default_provider.as_deref()
        };
        let provider = inferred
            .ok_or_else(|| GatewayError::UnknownProvider(model.to_string()))?
            .to_string();
        if self.inner.registry.get(&provider).is_none() {
            return Err(GatewayError::UnknownProvider(format!(
                "{provider} (disabled or unconfigured)"
            )));
        }
        Ok((provider, model.to_string()))
    }

    fn transformer_for(&self, provider: &str, model: &str) -> StreamTransformer {
        let created = OffsetDateTime::now_utc().unix_timestamp();
        match provider {
            "anthropic" => StreamTransformer::Anthropic(AnthropicStream::new(
                new_request_id(),
                model.to_string(),
                created,
            )),
            "gemini" => StreamTransformer::Gemini(GeminiStream::new(
                new_request_id(),
                model.to_string(),
                created,
            )),
            _ => StreamTransformer::OpenAI(OpenAIStream::new(
                new_request_id(),
                model.to_string(),
                created,
            )),
        }
    }

    /// One gateway request after auth and admission: route, breaker check,
    /// adapter call, and either a materialized JSON response or a spawned
    /// streaming pipeline.
    pub async fn execute(
        &self,
        principal: &Principal,
        api_type: ApiType,
        mut payload: JsonValue,
        stream: bool,
        trace_id: String,
        cancel: CancellationToken,
    ) -> Result<EngineResponse, GatewayError> {
        let incoming_model = payload
            .get("model")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidRequest("missing model".to_string()))?;
        let (provider_name, model) = self.route(&incoming_model)?;
        let adapter = self
            .inner
            .registry
            .get(&provider_name)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_name.clone()))?;
        let circuit = self.inner.circuits.get(&provider_name);
        if let Some(circuit) = &circuit {
            circuit.check()?;
        }

        payload["model"] = json!(model.clone());
        // Anthropic- and Gemini-shaped ingress is normalized to the unified
        // chat dialect before it reaches an adapter; the incoming type
        // survives in accounting only.
        let dispatch_type = match api_type {
            ApiType::Messages | ApiType::Gemini => ApiType::Chat,
            other => other,
        };
        let request = ProviderRequest {
            api_type: dispatch_type,
            model: model.clone(),
            payload,
            stream,
            trace_id: trace_id.clone(),
        };
        let meta = RequestMeta {
            trace_id,
            principal: principal.clone(),
            api_type,
            incoming_model,
            model,
            provider: provider_name.clone(),
        };
        let started = Instant::now();

        if stream {
            self.execute_streaming(adapter, request, meta, circuit, started, cancel)
                .await
        } else {
            self.execute_materialized(adapter, request, meta, circuit, started, cancel)
                .await
        }
    }

    async fn execute_materialized(
        &self,
        adapter: Arc<dyn rad_provider_core::ProviderAdapter>,
        request: ProviderRequest,
        meta: RequestMeta,
        circuit: Option<Arc<rad_provider_core::CircuitBreaker>>,
        started: Instant,
        cancel: CancellationToken,
    ) -> Result<EngineResponse, GatewayError> {
        match adapter.execute(request, &cancel).await {
            Ok(result) => {
                if let Some(circuit) = &circuit {
                    circuit.record_success();
                }
                self.inner
                    .health
                    .record_success(&meta.provider, started.elapsed());
                let usage = result.usage.unwrap_or_default();
                self.inner
                    .cost
                    .record(&meta.model, &usage, usage.cost_total);
                self.inner.usage.record(meta.record(
                    "success",
                    started.elapsed(),
                    &usage,
                    false,
                ));
                match result.payload {
                    ResultPayload::Json(body) => Ok(EngineResponse::Json(body)),
                    ResultPayload::Stream(_) => Err(GatewayError::Internal(
                        "adapter returned a stream for a non-streaming call".to_string(),
                    )),
                }
            }
            Err(error) => {
                self.record_upstream_error(&meta, &circuit, &error);
                self.inner.usage.record(meta.record(
                    "error",
                    started.elapsed(),
                    &ChunkUsage::default(),
                    false,
                ));
                Err(error)
            }
        }
    }

    async fn execute_streaming(
        &self,
        adapter: Arc<dyn rad_provider_core::ProviderAdapter>,
        request: ProviderRequest,
        meta: RequestMeta,
        circuit: Option<Arc<rad_provider_core::CircuitBreaker>>,
        started: Instant,
        cancel: CancellationToken,
    ) -> Result<EngineResponse, GatewayError> {
        let Some(permit) = self.inner.gate.try_acquire() else {
            return Err(GatewayError::StreamsSaturated);
        };

        let result = match adapter.execute(request, &cancel).await {
            Ok(result) => result,
            Err(error) => {
                drop(permit);
                self.record_upstream_error(&meta, &circuit, &error);
                self.inner.usage.record(meta.record(
                    "error",
                    started.elapsed(),
                    &ChunkUsage::default(),
                    false,
                ));
                return Err(error);
            }
        };
        let ResultPayload::Stream(upstream) = result.payload else {
            drop(permit);
            return Err(GatewayError::Internal(
                "adapter returned json for a streaming call".to_string(),
            ));
        };

        let config = self.config();
        let (pipe, pipe_errors) = StreamPipe::new(config.stream_buffer);
        // The admission slot tracks true in-flight streams: it comes back
        // when the pipe's done signal fires, on every exit path.
        permit.release_on_done(pipe.done());
        let (writer, body) = ClientWriter::channel(32);
        let transformer = self.transformer_for(&meta.provider, &meta.model);
        let mut orchestrator = StreamOrchestrator::spawn(
            upstream,
            transformer,
            pipe,
            pipe_errors,
            writer,
            cancel.child_token(),
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let (stats, error) = orchestrator.wait().await;
            engine.finish_stream(meta, circuit, started, stats, error);
        });

        Ok(EngineResponse::Stream { body })
    }

    fn finish_stream(
        &self,
        meta: RequestMeta,
        circuit: Option<Arc<rad_provider_core::CircuitBreaker>>,
        started: Instant,
        stats: StreamStats,
        error: Option<GatewayError>,
    ) {
        let elapsed = started.elapsed();
        let status = match &error {
            None => "success",
            Some(GatewayError::ClientDisconnect) => "cancelled",
            Some(_) => "error",
        };
        match &error {
            None | Some(GatewayError::ClientDisconnect) => {
                if let Some(circuit) = &circuit {
                    circuit.record_success();
                }
                self.inner.health.record_success(&meta.provider, elapsed);
            }
            Some(error) => {
                self.record_upstream_error(&meta, &circuit, error);
            }
        }

        // Terminal usage when the upstream provided it; otherwise the
        // one-token-per-delta floor.
        let (mut usage, estimated) = match stats.usage.clone() {
            Some(usage) => (usage, false),
            None => (
                ChunkUsage {
                    prompt_tokens: 0,
                    completion_tokens: stats.content_deltas,
                    total_tokens: stats.content_deltas,
                    cost_total: None,
                },
                true,
            ),
        };
        if usage.cost_total.is_none() {
            usage.cost_total = self.inner.pricing.cost(&meta.model, &usage);
        }
        self.inner
            .cost
            .record(&meta.model, &usage, usage.cost_total);
        info!(
            event = "stream_finished",
            trace_id = %meta.trace_id,
            provider = %meta.provider,
            model = %meta.model,
            status = status,
            chunks = stats.chunks,
            overflows = stats.overflows,
            elapsed_ms = elapsed.as_millis() as u64
        );
        self.inner
            .usage
            .record(meta.record(status, elapsed, &usage, estimated));
    }

    fn record_upstream_error(
        &self,
        meta: &RequestMeta,
        circuit: &Option<Arc<rad_provider_core::CircuitBreaker>>,
        error: &GatewayError,
    ) {
        match error {
            GatewayError::UpstreamTransient(message) => {
                if let Some(circuit) = circuit {
                    circuit.record_failure(message);
                }
                self.inner.health.record_failure(&meta.provider);
            }
            GatewayError::StreamParse(_) | GatewayError::StreamTransform(_) => {
                self.inner.health.record_failure(&meta.provider);
            }
            _ => {}
        }
    }
}

fn principal_from(info: ApiKeyInfo, now: OffsetDateTime) -> Result<Principal, GatewayError> {
    if !info.valid {
        return Err(GatewayError::Forbidden("api key disabled".to_string()));
    }
    if info.is_expired(now) {
        return Err(GatewayError::Unauthenticated("api key expired".to_string()));
    }
    Ok(Principal {
        key_name: info.name,
        key_hash: info.key_hash,
        project_id: info.project_id,
        rate_limit: info.rate_limit,
    })
}

#[derive(Clone)]
struct RequestMeta {
    trace_id: String,
    principal: Principal,
    api_type: ApiType,
    incoming_model: String,
    model: String,
    provider: String,
}

impl RequestMeta {
    fn record(
        &self,
        status: &str,
        elapsed: Duration,
        usage: &ChunkUsage,
        estimated: bool,
    ) -> UsageRecord {
        UsageRecord {
            request_id: new_request_id(),
            trace_id: self.trace_id.clone(),
            api_key_name: self.principal.key_name.clone(),
            incoming_api_type: self.api_type.as_str().to_string(),
            incoming_model: self.incoming_model.clone(),
            selected_model: self.model.clone(),
            provider: self.provider.clone(),
            response_status: status.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost_usd: usage.cost_total,
            usage_estimated: estimated,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
