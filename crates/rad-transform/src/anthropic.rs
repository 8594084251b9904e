use rad_protocol::anthropic::{
    AnthropicUsage, MessagesResponse, StreamEvent, StreamEventKnown,
};
use rad_protocol::chunk::{Chunk, ChunkUsage, FinishReason};
use rad_protocol::openai::{
    ChatChoice, ChatCompletionResponse, ChatMessage, Usage, CHAT_COMPLETION_OBJECT,
};
use rad_protocol::sse::SseEvent;

use crate::{TransformError, TransformOutcome};

/// Anthropic spreads message identity and usage across events; the state
/// carries them forward so every emitted chunk is self-describing.
#[derive(Debug)]
pub struct AnthropicStream {
    id: String,
    model: String,
    created: i64,
    usage: AnthropicUsage,
    finished: bool,
}

impl AnthropicStream {
    pub fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            usage: AnthropicUsage::default(),
            finished: false,
        }
    }

    pub fn transform(&mut self, event: &SseEvent) -> TransformOutcome {
        let event: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(event) => event,
            Err(err) => {
                return TransformOutcome::Error(TransformError::Malformed {
                    provider: "anthropic",
                    detail: err.to_string(),
                });
            }
        };
        let known = match event {
            StreamEvent::Known(known) => known,
            StreamEvent::Unknown(_) => return TransformOutcome::Skip,
        };

        match known {
            StreamEventKnown::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens;
                    self.usage.output_tokens = self.usage.output_tokens.max(usage.output_tokens);
                }
                let role = if message.role.is_empty() {
                    "assistant".to_string()
                } else {
                    message.role
                };
                TransformOutcome::Chunk(self.chunk().with_role(role))
            }
            StreamEventKnown::ContentBlockDelta { delta, .. } => match delta.text {
                Some(text) if !text.is_empty() => {
                    TransformOutcome::Chunk(self.chunk().with_content(text))
                }
                _ => TransformOutcome::Skip,
            },
            StreamEventKnown::MessageDelta { usage, .. } => {
                // Accumulated for the terminal chunk; the event itself is not
                // forwarded.
                if let Some(usage) = usage {
                    self.usage.output_tokens = self.usage.output_tokens.max(usage.output_tokens);
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                }
                TransformOutcome::Skip
            }
            StreamEventKnown::MessageStop => {
                self.finished = true;
                let mut chunk = self.chunk().with_finish(FinishReason::Stop);
                if self.usage.input_tokens > 0 || self.usage.output_tokens > 0 {
                    chunk = chunk.with_usage(ChunkUsage {
                        prompt_tokens: self.usage.input_tokens,
                        completion_tokens: self.usage.output_tokens,
                        total_tokens: self.usage.input_tokens + self.usage.output_tokens,
                        cost_total: None,
                    });
                }
                TransformOutcome::Chunk(chunk)
            }
            StreamEventKnown::Ping
            | StreamEventKnown::ContentBlockStart { .. }
            | StreamEventKnown::ContentBlockStop { .. } => TransformOutcome::Skip,
            StreamEventKnown::Error { error } => TransformOutcome::Error(
                TransformError::Upstream(format!("{}: {}", error.kind, error.message)),
            ),
        }
    }

    fn chunk(&self) -> Chunk {
        Chunk::new(self.id.clone(), self.model.clone(), self.created)
    }
}

pub fn map_stop_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Non-streaming messages response mapped into the unified chat shape.
pub fn response_to_chat(response: MessagesResponse) -> ChatCompletionResponse {
    let text: String = response
        .content
        .iter()
        .filter_map(|block| block.text.as_deref())
        .collect();
    let usage = response.usage.map(|usage| Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
    });
    ChatCompletionResponse {
        id: response.id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: 0,
        model: response.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text(response.role, text),
            finish_reason: Some(map_stop_reason(response.stop_reason.as_deref())),
        }],
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(data: &str) -> SseEvent {
        SseEvent {
            data: data.to_string(),
            ..SseEvent::default()
        }
    }

    fn stream() -> AnthropicStream {
        AnthropicStream::new("unknown".to_string(), "unknown".to_string(), 1_700_000_000)
    }

    #[test]
    fn maps_message_lifecycle_to_unified_chunks() {
        let mut state = stream();

        let first = state.transform(&data_event(
            r#"{"type":"message_start","message":{"id":"m1","model":"claude-3","role":"assistant"}}"#,
        ));
        let TransformOutcome::Chunk(first) = first else {
            panic!("expected chunk, got {first:?}");
        };
        assert_eq!(first.id, "m1");
        assert_eq!(first.model, "claude-3");
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));

        let second = state.transform(&data_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        ));
        let TransformOutcome::Chunk(second) = second else {
            panic!("expected chunk, got {second:?}");
        };
        assert_eq!(second.id, "m1");
        assert_eq!(second.content(), Some("Hello"));

        let last = state.transform(&data_event(r#"{"type":"message_stop"}"#));
        let TransformOutcome::Chunk(last) = last else {
            panic!("expected chunk, got {last:?}");
        };
        assert!(last.is_finished());
        assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
    }

    #[test]
    fn ping_and_block_stop_are_skipped() {
        let mut state = stream();
        assert!(matches!(
            state.transform(&data_event(r#"{"type":"ping"}"#)),
            TransformOutcome::Skip
        ));
        assert!(matches!(
            state.transform(&data_event(r#"{"type":"content_block_stop","index":0}"#)),
            TransformOutcome::Skip
        ));
    }

    #[test]
    fn message_delta_usage_lands_on_terminal_chunk() {
        let mut state = stream();
        state.transform(&data_event(
            r#"{"type":"message_start","message":{"id":"m1","model":"claude-3","role":"assistant","usage":{"input_tokens":12,"output_tokens":0}}}"#,
        ));
        assert!(matches!(
            state.transform(&data_event(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            )),
            TransformOutcome::Skip
        ));
        let TransformOutcome::Chunk(last) = state.transform(&data_event(r#"{"type":"message_stop"}"#))
        else {
            panic!("expected terminal chunk");
        };
        let usage = last.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 19);
    }

    #[test]
    fn error_event_surfaces_as_error() {
        let mut state = stream();
        assert!(matches!(
            state.transform(&data_event(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
            )),
            TransformOutcome::Error(TransformError::Upstream(_))
        ));
    }

    #[test]
    fn response_maps_to_chat_shape() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{"id":"m9","model":"claude-3","role":"assistant","content":[{"type":"text","text":"Hi there"}],"stop_reason":"max_tokens","usage":{"input_tokens":3,"output_tokens":4}}"#,
        )
        .unwrap();
        let chat = response_to_chat(response);
        assert_eq!(chat.id, "m9");
        assert_eq!(chat.choices[0].message.content_text(), "Hi there");
        assert_eq!(chat.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(chat.usage.unwrap().total_tokens, 7);
    }
}
