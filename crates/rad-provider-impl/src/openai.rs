use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use rad_common::GatewayError;
use rad_protocol::chunk::ChunkUsage;
use rad_provider_core::{
    ApiType, PricingTable, ProviderAdapter, ProviderRequest, ProviderResult, ResponseStatus,
    ResultPayload,
};

use crate::client::{shared_client, stream_client, DEFAULT_UPSTREAM_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::upstream::{json_body, send_once, send_with_retry, stream_body, CallCtx};

pub const PROVIDER_NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAIAdapter {
    base_url: String,
    api_key: String,
    timeout: Duration,
    retry: RetryPolicy,
    pricing: Arc<PricingTable>,
}

impl OpenAIAdapter {
    pub fn new(api_key: impl Into<String>, pricing: Arc<PricingTable>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
            retry: RetryPolicy::default(),
            pricing,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whole-exchange deadline for non-streaming calls. Streams are bounded
    /// by the idle guard instead.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| GatewayError::Internal("invalid api key bytes".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

pub(crate) fn build_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// `usage` object of a unified (OpenAI-shape) response body.
pub(crate) fn usage_from_response(value: &JsonValue) -> Option<ChunkUsage> {
    let usage = value.get("usage")?;
    Some(ChunkUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(JsonValue::as_u64)?,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0),
        total_tokens: usage
            .get("total_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0),
        cost_total: None,
    })
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResult, GatewayError> {
        let (path, op) = match request.api_type {
            ApiType::Chat => ("/v1/chat/completions", "openai.chat"),
            ApiType::Embeddings => ("/v1/embeddings", "openai.embeddings"),
            ApiType::Responses => ("/v1/responses", "openai.responses"),
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "api type {} not supported by {PROVIDER_NAME}",
                    other.as_str()
                )));
            }
        };
        let url = build_url(&self.base_url, path);
        let mut payload = request.payload.clone();
        if request.stream {
            payload["stream"] = json!(true);
        }
        let client = if request.stream {
            stream_client(STREAM_IDLE_TIMEOUT)?
        } else {
            shared_client(self.timeout)?
        };
        let headers = self.headers()?;
        let ctx = CallCtx {
            trace_id: &request.trace_id,
            provider: PROVIDER_NAME,
            op,
            path,
            model: &request.model,
            is_stream: request.stream,
        };
        let send = || {
            client
                .post(&url)
                .headers(headers.clone())
                .json(&payload)
                .send()
        };

        if request.stream {
            let response = send_once(&ctx, cancel, send).await?;
            return Ok(ProviderResult {
                model: request.model,
                provider: PROVIDER_NAME.to_string(),
                status: ResponseStatus::Success,
                usage: None,
                payload: ResultPayload::Stream(stream_body(response, STREAM_IDLE_TIMEOUT)),
            });
        }

        let response = send_with_retry(&ctx, &self.retry, cancel, send).await?;
        let body = json_body(response).await?;
        let usage = usage_from_response(&body).map(|mut usage| {
            usage.cost_total = self.pricing.cost(&request.model, &usage);
            usage
        });
        Ok(ProviderResult {
            model: request.model,
            provider: PROVIDER_NAME.to_string(),
            status: ResponseStatus::Success,
            usage,
            payload: ResultPayload::Json(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_composition_trims_trailing_slash() {
        assert_eq!(
            build_url("https://api.openai.com/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn usage_extraction_requires_prompt_tokens() {
        let body = json!({"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}});
        let usage = usage_from_response(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.total_tokens, 8);
        assert!(usage_from_response(&json!({"choices":[]})).is_none());
    }
}
