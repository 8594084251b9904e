use bytes::{Bytes, BytesMut};

pub const CONTENT_TYPE: &str = "text/event-stream";
pub const CACHE_CONTROL: &str = "no-cache";
pub const CONNECTION: &str = "keep-alive";
/// Tells nginx-style intermediaries not to buffer the response.
pub const ACCEL_BUFFERING: &str = "no";

/// One server-sent event. `data` is the `\n`-joined value of all `data:`
/// fields in the frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: Some("message".to_string()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Serializes the event in field order `id`, `event`, `retry`, then one
    /// `data:` line per payload line, followed by the blank separator line.
    /// CR/LF inside `id`/`event` values are replaced by a space to preserve
    /// framing.
    pub fn to_frame(&self) -> Bytes {
        let mut out = BytesMut::new();
        if let Some(id) = &self.id {
            out.extend_from_slice(b"id: ");
            out.extend_from_slice(sanitize(id).as_bytes());
            out.extend_from_slice(b"\n");
        }
        if let Some(event) = &self.event {
            out.extend_from_slice(b"event: ");
            out.extend_from_slice(sanitize(event).as_bytes());
            out.extend_from_slice(b"\n");
        }
        if let Some(retry) = self.retry {
            out.extend_from_slice(b"retry: ");
            out.extend_from_slice(retry.to_string().as_bytes());
            out.extend_from_slice(b"\n");
        }
        for line in self.data.split('\n') {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\n");
        }
        out.extend_from_slice(b"\n");
        out.freeze()
    }

    /// A comment frame (`: <text>`), invisible to SSE consumers.
    pub fn comment_frame(text: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(text.len() + 4);
        out.extend_from_slice(b": ");
        out.extend_from_slice(sanitize(text).as_bytes());
        out.extend_from_slice(b"\n\n");
        out.freeze()
    }
}

fn sanitize(value: &str) -> String {
    if value.contains(['\r', '\n']) {
        value.replace(['\r', '\n'], " ")
    } else {
        value.to_string()
    }
}

/// Incremental SSE parser. Feed it transport chunks; it hands back every
/// completed event. Call [`SseParser::finish`] at EOF to flush a trailing
/// event whose terminating blank line never arrived.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            self.consume_line(&line);
        }

        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() && !line.starts_with(':') {
                self.consume_line(&line);
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                // The grammar strips at most one leading space.
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "id" => {
                self.id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "event" => {
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            "retry" => {
                // Values that fail to parse are silently ignored.
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.id.is_none()
            && self.event.is_none()
            && self.data_lines.is_empty()
            && self.retry.is_none()
        {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data,
            retry: self.retry.take(),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        let mut events = parser.push_str(input);
        events.extend(parser.finish());
        events
    }

    #[test]
    fn parses_basic_event() {
        let events = parse_all("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn crlf_parses_identically_to_lf() {
        let lf = parse_all("event: message\ndata: a\ndata: b\n\n");
        let crlf = parse_all("event: message\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(lf, crlf);
        assert_eq!(lf[0].data, "a\nb");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let events = parse_all(": keepalive 123\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn data_with_no_value_yields_empty_data() {
        let events = parse_all("data\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
    }

    #[test]
    fn strips_at_most_one_leading_space() {
        let events = parse_all("data:  two spaces\n\n");
        assert_eq!(events[0].data, " two spaces");
    }

    #[test]
    fn invalid_retry_is_ignored() {
        let events = parse_all("retry: soon\ndata: x\n\n");
        assert_eq!(events[0].retry, None);
        let events = parse_all("retry: 1500\ndata: x\n\n");
        assert_eq!(events[0].retry, Some(1500));
    }

    #[test]
    fn eof_flushes_pending_accumulator() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn eof_with_empty_accumulator_yields_nothing() {
        let mut parser = SseParser::new();
        parser.push_str("data: done\n\n");
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("da").is_empty());
        assert!(parser.push_str("ta: hel").is_empty());
        let events = parser.push_str("lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn frame_round_trip() {
        let event = SseEvent {
            id: Some("7".to_string()),
            event: Some("message".to_string()),
            data: "line1\nline2".to_string(),
            retry: Some(2000),
        };
        let frame = event.to_frame();
        let text = std::str::from_utf8(&frame).unwrap();
        assert_eq!(
            text,
            "id: 7\nevent: message\nretry: 2000\ndata: line1\ndata: line2\n\n"
        );
        let reparsed = parse_all(text);
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0], event);
    }

    #[test]
    fn newlines_in_event_name_are_replaced() {
        let event = SseEvent {
            event: Some("mess\nage".to_string()),
            data: "x".to_string(),
            ..SseEvent::default()
        };
        let frame = event.to_frame();
        assert_eq!(
            std::str::from_utf8(&frame).unwrap(),
            "event: mess age\ndata: x\n\n"
        );
    }
}
