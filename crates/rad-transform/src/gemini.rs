use rad_protocol::chunk::{Chunk, ChunkUsage, FinishReason};
use rad_protocol::gemini::{GenerateContentResponse, GeminiUsageMetadata};
use rad_protocol::openai::{
    ChatChoice, ChatCompletionResponse, ChatMessage, Usage, CHAT_COMPLETION_OBJECT,
};
use rad_protocol::sse::SseEvent;

use crate::{TransformError, TransformOutcome};

/// Gemini does not carry a response id on the wire; the caller supplies a
/// synthetic one at stream construction.
#[derive(Debug)]
pub struct GeminiStream {
    id: String,
    model: String,
    created: i64,
    finished: bool,
}

impl GeminiStream {
    pub fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            finished: false,
        }
    }

    pub fn transform(&mut self, event: &SseEvent) -> TransformOutcome {
        let response: GenerateContentResponse = match serde_json::from_str(&event.data) {
            Ok(response) => response,
            Err(err) => {
                return TransformOutcome::Error(TransformError::Malformed {
                    provider: "gemini",
                    detail: err.to_string(),
                });
            }
        };

        let Some(candidate) = response.candidates.first() else {
            return TransformOutcome::Skip;
        };

        let mut chunk = Chunk::new(self.id.clone(), self.model.clone(), self.created);
        let text = candidate.content.text();
        if !text.is_empty() {
            chunk = chunk.with_content(text);
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finished = true;
            let reason = map_finish_reason(reason);
            if chunk.choices.is_empty() {
                chunk = chunk.with_finish(reason);
            } else {
                chunk.choices[0].finish_reason = Some(reason);
                chunk.terminal = true;
            }
        }
        if let Some(metadata) = response.usage_metadata {
            chunk = chunk.with_usage(map_usage(&metadata));
        }
        if chunk.choices.is_empty() && chunk.usage.is_none() {
            return TransformOutcome::Skip;
        }
        TransformOutcome::Chunk(chunk)
    }
}

pub fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "OTHER" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

pub fn map_usage(metadata: &GeminiUsageMetadata) -> ChunkUsage {
    ChunkUsage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
        cost_total: None,
    }
}

/// Non-streaming generateContent response mapped into the unified chat shape.
pub fn response_to_chat(
    response: GenerateContentResponse,
    id: String,
    model: String,
    created: i64,
) -> ChatCompletionResponse {
    let (text, finish_reason) = response
        .candidates
        .first()
        .map(|candidate| {
            (
                candidate.content.text(),
                candidate
                    .finish_reason
                    .as_deref()
                    .map(map_finish_reason)
                    .unwrap_or(FinishReason::Stop),
            )
        })
        .unwrap_or((String::new(), FinishReason::Stop));
    let usage = response.usage_metadata.map(|metadata| Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
    });
    ChatCompletionResponse {
        id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text("assistant", text),
            finish_reason: Some(finish_reason),
        }],
        usage,
    }
}
