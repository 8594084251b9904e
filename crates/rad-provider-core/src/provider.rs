use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use rad_common::GatewayError;
use rad_protocol::chunk::ChunkUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    Chat,
    Embeddings,
    Responses,
    Messages,
    Gemini,
    Images,
    Transcriptions,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Chat => "chat",
            ApiType::Embeddings => "embeddings",
            ApiType::Responses => "responses",
            ApiType::Messages => "messages",
            ApiType::Gemini => "gemini",
            ApiType::Images => "images",
            ApiType::Transcriptions => "transcriptions",
        }
    }
}

/// One normalized upstream call. `payload` is the unified (OpenAI-shape)
/// request body.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub api_type: ApiType,
    pub model: String,
    pub payload: JsonValue,
    pub stream: bool,
    pub trace_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

pub enum ResultPayload {
    /// Fully-materialized response object.
    Json(JsonValue),
    /// Readable handle onto the upstream SSE body.
    Stream(ByteStream),
}

impl std::fmt::Debug for ResultPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultPayload::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ResultPayload::Stream(_) => f.debug_tuple("Stream").field(&"<opaque>").finish(),
        }
    }
}

#[derive(Debug)]
pub struct ProviderResult {
    pub model: String,
    pub provider: String,
    pub status: ResponseStatus,
    pub usage: Option<ChunkUsage>,
    pub payload: ResultPayload,
}

/// One upstream LLM provider. Implementations are `{openai, anthropic,
/// gemini, mock}`; routing picks one by name.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResult, GatewayError>;
}
