//! Deterministic in-process adapter for tests and keyless local runs. It
//! speaks the OpenAI stream dialect, so the engine pairs it with the OpenAI
//! transformer.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use rad_common::{new_request_id, GatewayError};
use rad_protocol::chunk::ChunkUsage;
use rad_protocol::openai::ChatCompletionRequest;
use rad_provider_core::{
    PricingTable, ProviderAdapter, ProviderRequest, ProviderResult, ResponseStatus, ResultPayload,
};

pub const PROVIDER_NAME: &str = "mock";

pub struct MockAdapter {
    pricing: Arc<PricingTable>,
}

impl MockAdapter {
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self { pricing }
    }

    fn reply_for(request: &ProviderRequest) -> (String, u64) {
        let prompt = serde_json::from_value::<ChatCompletionRequest>(request.payload.clone())
            .ok()
            .and_then(|chat| {
                chat.messages
                    .iter()
                    .rev()
                    .find(|message| message.role == "user")
                    .map(|message| message.content_text())
            })
            .unwrap_or_default();
        let prompt_tokens = prompt.split_whitespace().count().max(1) as u64;
        (format!("echo: {prompt}"), prompt_tokens)
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<ProviderResult, GatewayError> {
        let (content, prompt_tokens) = Self::reply_for(&request);
        let completion_tokens = content.split_whitespace().count() as u64;
        let mut usage = ChunkUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_total: None,
        };
        usage.cost_total = self.pricing.cost(&request.model, &usage);
        let id = new_request_id();
        let created = OffsetDateTime::now_utc().unix_timestamp();

        if request.stream {
            let mut frames: Vec<String> = Vec::new();
            let head = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": request.model,
                "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}],
            });
            frames.push(format!("data: {head}\n\n"));
            for word in content.split_inclusive(' ') {
                let delta = json!({
                    "id": id,
                    "choices": [{"index": 0, "delta": {"content": word}, "finish_reason": null}],
                });
                frames.push(format!("data: {delta}\n\n"));
            }
            let tail = json!({
                "id": id,
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                "usage": usage,
            });
            frames.push(format!("data: {tail}\n\n"));
            frames.push("data: [DONE]\n\n".to_string());

            let body =
                stream::iter(frames).map(|frame| Ok::<_, io::Error>(Bytes::from(frame)));
            return Ok(ProviderResult {
                model: request.model,
                provider: PROVIDER_NAME.to_string(),
                status: ResponseStatus::Success,
                usage: Some(usage),
                payload: ResultPayload::Stream(Box::pin(body)),
            });
        }

        let body = json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
            "usage": usage,
        });
        Ok(ProviderResult {
            model: request.model,
            provider: PROVIDER_NAME.to_string(),
            status: ResponseStatus::Success,
            usage: Some(usage),
            payload: ResultPayload::Json(body),
        })
    }
}
