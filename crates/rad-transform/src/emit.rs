//! Egress framing: unified chunks onto the client's SSE stream.

use rad_protocol::chunk::Chunk;
use rad_protocol::sse::SseEvent;

pub const DONE_FRAME_DATA: &str = "[DONE]";
pub const MESSAGE_EVENT: &str = "message";

/// A chunk as one `event: message` frame with OpenAI-shape JSON data.
pub fn chunk_frame(chunk: &Chunk) -> Result<SseEvent, serde_json::Error> {
    Ok(SseEvent {
        event: Some(MESSAGE_EVENT.to_string()),
        data: serde_json::to_string(chunk)?,
        ..SseEvent::default()
    })
}

/// The stream-terminating `data: [DONE]` frame.
pub fn done_frame() -> SseEvent {
    SseEvent {
        data: DONE_FRAME_DATA.to_string(),
        ..SseEvent::default()
    }
}

#[cfg(test)]
mod tests {
    use rad_protocol::chunk::FinishReason;

    use super::*;

    #[test]
    fn message_frame_keeps_null_finish_reason() {
        let chunk = Chunk::new("c1", "gpt-4", 1).with_content("Hi");
        let frame = chunk_frame(&chunk).unwrap();
        assert_eq!(frame.event.as_deref(), Some(MESSAGE_EVENT));
        assert!(frame.data.contains("\"finish_reason\":null"));
    }

    #[test]
    fn done_frame_is_bare_marker() {
        let bytes = done_frame().to_frame();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn terminal_frame_serializes_reason() {
        let chunk = Chunk::new("c1", "gpt-4", 1).with_finish(FinishReason::ContentFilter);
        let frame = chunk_frame(&chunk).unwrap();
        assert!(frame.data.contains("\"finish_reason\":\"content_filter\""));
    }
}
