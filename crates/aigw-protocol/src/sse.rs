//! Server-sent-event parsing (upstream) and framing (downstream).

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.  Feed it arbitrary byte chunks; it yields complete
/// events as blank-line terminators arrive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
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
                self.flush_pending(&mut events);
            } else {
                self.consume_line(&line);
            }
        }

        events
    }

    /// Drain whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line);
        }
        let mut events = Vec::new();
        self.flush_pending(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = field_value(line, "event") {
            self.event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return;
        }
        if let Some(value) = field_value(line, "data") {
            self.data_lines.push(value.to_string());
        }
    }

    fn flush_pending(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    if line == field {
        return Some("");
    }
    let value = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Frame one outbound SSE event.  The `event:` line is emitted only when a
/// name is given (Claude and OpenAI-Responses dialects name their events;
/// OpenAI Chat does not).
pub fn frame_event(name: Option<&str>, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 16);
    if let Some(name) = name {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(data);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Terminal frame for OpenAI-style streams.
pub fn frame_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message_start\nda").is_empty());
        let events = parser.push_str("ta: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn ignores_comment_lines() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keep-alive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn frames_with_and_without_event_line() {
        assert_eq!(
            frame_event(Some("ping"), "{}"),
            Bytes::from_static(b"event: ping\ndata: {}\n\n")
        );
        assert_eq!(frame_event(None, "{}"), Bytes::from_static(b"data: {}\n\n"));
    }
}
