use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use rad_common::GatewayError;
use rad_protocol::anthropic::{self, MessagesResponse};
use rad_protocol::chunk::ChunkUsage;
use rad_protocol::openai::ChatCompletionRequest;
use rad_provider_core::{
    ApiType, PricingTable, ProviderAdapter, ProviderRequest, ProviderResult, ResponseStatus,
    ResultPayload,
};
use rad_transform::request::chat_to_anthropic;

use crate::client::{shared_client, stream_client, DEFAULT_UPSTREAM_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::openai::build_url;
use crate::retry::RetryPolicy;
use crate::upstream::{json_body, send_once, send_with_retry, stream_body, CallCtx};

pub const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const HEADER_API_KEY: &str = "x-api-key";
const HEADER_VERSION: &str = "anthropic-version";
const MESSAGES_PATH: &str = "/v1/messages";

pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    timeout: Duration,
    retry: RetryPolicy,
    pricing: Arc<PricingTable>,
}

impl AnthropicAdapter {
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
        headers.insert(
            HEADER_VERSION,
            HeaderValue::from_static(anthropic::API_VERSION),
        );
        Ok(headers)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResult, GatewayError> {
        if !matches!(request.api_type, ApiType::Chat | ApiType::Messages) {
            return Err(GatewayError::InvalidRequest(format!(
                "api type {} not supported by {PROVIDER_NAME}",
                request.api_type.as_str()
            )));
        }

        let chat: ChatCompletionRequest = serde_json::from_value(request.payload.clone())
            .map_err(|err| GatewayError::InvalidRequest(format!("malformed chat request: {err}")))?;
        let mut body = chat_to_anthropic(&chat);
        body.model = request.model.clone();
        body.stream = request.stream.then_some(true);

        let url = build_url(&self.base_url, MESSAGES_PATH);
        let client = if request.stream {
            stream_client(STREAM_IDLE_TIMEOUT)?
        } else {
            shared_client(self.timeout)?
        };
        let headers = self.headers()?;
        let ctx = CallCtx {
            trace_id: &request.trace_id,
            provider: PROVIDER_NAME,
            op: "anthropic.messages",
            path: MESSAGES_PATH,
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
        let messages: MessagesResponse =
            serde_json::from_value(value).map_err(|err| GatewayError::UpstreamTerminal {
                status: 502,
                message: format!("undecodable messages response: {err}"),
            })?;
        let usage = messages.usage.as_ref().map(|usage| {
            let mut unified = ChunkUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
                cost_total: None,
            };
            unified.cost_total = self.pricing.cost(&request.model, &unified);
            unified
        });
        let mut chat = rad_transform::anthropic::response_to_chat(messages);
        chat.created = OffsetDateTime::now_utc().unix_timestamp();
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
