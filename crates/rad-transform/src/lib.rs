pub mod anthropic;
pub mod emit;
pub mod gemini;
pub mod openai;
pub mod request;

use rad_protocol::chunk::Chunk;
use rad_protocol::sse::SseEvent;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("malformed {provider} stream payload: {detail}")]
    Malformed { provider: &'static str, detail: String },
    #[error("upstream error event: {0}")]
    Upstream(String),
}

/// Result of feeding one upstream SSE event through a provider transformer.
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    /// A unified chunk to forward downstream.
    Chunk(Chunk),
    /// Housekeeping event with no downstream counterpart.
    Skip,
    /// Terminal marker that carries no chunk of its own (OpenAI `[DONE]`).
    Done,
    Error(TransformError),
}

/// Stateful per-provider stream transformer. One instance per stream; events
/// must be fed in upstream order.
#[derive(Debug)]
pub enum StreamTransformer {
    OpenAI(openai::OpenAIStream),
    Anthropic(anthropic::AnthropicStream),
    Gemini(gemini::GeminiStream),
}

impl StreamTransformer {
    pub fn transform(&mut self, event: &SseEvent) -> TransformOutcome {
        match self {
            StreamTransformer::OpenAI(state) => state.transform(event),
            StreamTransformer::Anthropic(state) => state.transform(event),
            StreamTransformer::Gemini(state) => state.transform(event),
        }
    }
}
