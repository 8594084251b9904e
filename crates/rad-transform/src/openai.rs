use rad_protocol::chunk::{Chunk, CHUNK_OBJECT};
use rad_protocol::sse::SseEvent;

use crate::{TransformError, TransformOutcome};

pub const DONE_PAYLOAD: &str = "[DONE]";

/// OpenAI chunks pass through almost verbatim; the state only back-fills
/// identity fields that later chunks in a stream elide.
#[derive(Debug)]
pub struct OpenAIStream {
    id: String,
    model: String,
    created: i64,
    finished: bool,
}

impl OpenAIStream {
    pub fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            finished: false,
        }
    }

    pub fn transform(&mut self, event: &SseEvent) -> TransformOutcome {
        if event.event.as_deref() == Some("error") {
            return TransformOutcome::Error(TransformError::Upstream(event.data.clone()));
        }
        if event.data == DONE_PAYLOAD {
            return TransformOutcome::Done;
        }

        let mut chunk: Chunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                return TransformOutcome::Error(TransformError::Malformed {
                    provider: "openai",
                    detail: err.to_string(),
                });
            }
        };

        // Remember identity from the first full chunk, back-fill sparse ones.
        if !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        } else {
            chunk.id = self.id.clone();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        } else {
            chunk.model = self.model.clone();
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        } else {
            chunk.created = self.created;
        }
        if chunk.object.is_empty() {
            chunk.object = CHUNK_OBJECT.to_string();
        }

        if chunk.finish_reason().is_some() {
            self.finished = true;
            chunk.terminal = true;
        }
        TransformOutcome::Chunk(chunk)
    }
}

#[cfg(test)]
mod tests {
    use rad_protocol::chunk::FinishReason;

    use super::*;

    fn data_event(data: &str) -> SseEvent {
        SseEvent {
            data: data.to_string(),
            ..SseEvent::default()
        }
    }

    fn stream() -> OpenAIStream {
        OpenAIStream::new("unknown".to_string(), "unknown".to_string(), 0)
    }

    #[test]
    fn passes_chunks_through_and_marks_terminal() {
        let mut state = stream();
        let outcomes = [
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#,
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ]
        .map(|payload| state.transform(&data_event(payload)));

        let chunks: Vec<Chunk> = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                TransformOutcome::Chunk(chunk) => chunk,
                other => panic!("unexpected outcome: {other:?}"),
            })
            .collect();

        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[1].content(), Some("Hi"));
        assert_eq!(chunks[1].model, "gpt-4");
        assert!(!chunks[1].is_finished());
        assert_eq!(chunks[2].finish_reason(), Some(FinishReason::Stop));
        assert!(chunks[2].is_finished());

        assert!(matches!(
            state.transform(&data_event(DONE_PAYLOAD)),
            TransformOutcome::Done
        ));
    }

    #[test]
    fn error_event_is_terminal() {
        let mut state = stream();
        let event = SseEvent {
            event: Some("error".to_string()),
            data: r#"{"message":"boom"}"#.to_string(),
            ..SseEvent::default()
        };
        assert!(matches!(
            state.transform(&event),
            TransformOutcome::Error(TransformError::Upstream(_))
        ));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut state = stream();
        assert!(matches!(
            state.transform(&data_event("{not json")),
            TransformOutcome::Error(TransformError::Malformed { .. })
        ));
    }
}
