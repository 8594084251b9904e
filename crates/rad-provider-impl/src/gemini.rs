use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use rad_common::{new_request_id, GatewayError};
use rad_protocol::chunk::ChunkUsage;
use rad_protocol::gemini::GenerateContentResponse;
use rad_protocol::openai::ChatCompletionRequest;
use rad_provider_core::{
    ApiType, PricingTable, ProviderAdapter, ProviderRequest, ProviderResult, ResponseStatus,
    ResultPayload,
};
use rad_transform::request::chat_to_gemini;

use crate::client::{shared_client, stream_client, DEFAULT_UPSTREAM_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::upstream::{json_body, send_once, send_with_retry, stream_body, CallCtx};

pub const PROVIDER_NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const HEADER_API_KEY: &str = "x-goog-api-key";

pub struct GeminiAdapter {
    base_url: String,
    api_key: String,
    timeout: Duration,
    retry: RetryPolicy,
    pricing: Arc<PricingTable>,
}

impl GeminiAdapter {
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
        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| GatewayError::Internal("invalid api key bytes".to_string()))?;
        headers.insert(HEADER_API_KEY, api_key);
        Ok(headers)
    }

    fn endpoint(&self, model: &str, stream: bool) -> (String, String) {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let path = format!("/v1beta/models/{model}:{action}");
        let url = if stream {
            // SSE framing instead of the default JSON array stream.
            format!("{}{path}?alt=sse", self.base_url.trim_end_matches('/'))
        } else {
            format!("{}{path}", self.base_url.trim_end_matches('/'))
        };
        (url, path)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResult, GatewayError> {
        if !matches!(request.api_type, ApiType::Chat | ApiType::Gemini) {
            return Err(GatewayError::InvalidRequest(format!(
                "api type {} not supported by {PROVIDER_NAME}",
                request.api_type.as_str()
            )));
        }

        let chat: ChatCompletionRequest = serde_json::from_value(request.payload.clone())
            .map_err(|err| GatewayError::InvalidRequest(format!("malformed chat request: {err}")))?;
        let body = chat_to_gemini(&chat);

        let (url, path) = self.endpoint(&request.model, request.stream);
        let client = if request.stream {
            stream_client(STREAM_IDLE_TIMEOUT)?
        } else {
            shared_client(self.timeout)?
        };
        let headers = self.headers()?;
        let ctx = CallCtx {
            trace_id: &request.trace_id,
            provider: PROVIDER_NAME,
            op: "gemini.generate",
            path: &path,
            model: &request.model,
            is_stream: request.stream,
        };
        let send = || {
            client
                .post(&url)
                .headers(headers.clone())
                .json(&body)
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
        let value = json_body(response).await?;
        let generate: GenerateContentResponse =
            serde_json::from_value(value).map_err(|err| GatewayError::UpstreamTerminal {
                status: 502,
                message: format!("undecodable generateContent response: {err}"),
            })?;
        let usage = generate.usage_metadata.as_ref().map(|metadata| {
            let mut unified = ChunkUsage {
                prompt_tokens: metadata.prompt_token_count,
                completion_tokens: metadata.candidates_token_count,
                total_tokens: metadata.total_token_count,
                cost_total: None,
            };
            unified.cost_total = self.pricing.cost(&request.model, &unified);
            unified
        });
        let chat = rad_transform::gemini::response_to_chat(
            generate,
            new_request_id(),
            request.model.clone(),
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let body = serde_json::to_value(&chat)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
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
    fn streaming_endpoint_uses_sse_alt() {
        let adapter = GeminiAdapter::new("k", Arc::new(PricingTable::builtin()));
        let (url, path) = adapter.endpoint("gemini-1.5-pro", true);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(path, "/v1beta/models/gemini-1.5-pro:streamGenerateContent");
        let (url, _) = adapter.endpoint("gemini-1.5-pro", false);
        assert!(url.ends_with(":generateContent"));
    }
}
