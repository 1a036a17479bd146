// Incremental `text/event-stream` decoder.
//
// Used for both MCP's HTTP+SSE transport and streamed chat completions.
// Bytes are fed as they arrive from the network; complete events are
// returned once their terminating blank line has been seen.

/// A parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `id:` field, if any.
    pub id: Option<String>,
    /// The `event:` field. Absent means the default `message` type.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Event type, defaulting to `message`
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes not yet forming a complete line (may end mid UTF-8 sequence).
    pending: Vec<u8>,
    current: SseEvent,
    has_data: bool,
    has_fields: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop(); // '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            // Comment / keep-alive
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            // `retry` and unknown fields are ignored
            _ => {}
        }
        self.has_fields = true;
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.current);
        let had_data = std::mem::take(&mut self.has_data);
        let had_fields = std::mem::take(&mut self.has_fields);

        // An event with only `event:` (e.g. FastMCP pings) still counts
        if had_data || (had_fields && event.event.is_some()) {
            Some(event)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_event() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.feed(b"event: endpoint\r\ndata: /messages/?session_id=abc\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "endpoint");
        assert_eq!(events[0].data, "/messages/?session_id=abc");
    }

    #[test]
    fn test_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":").is_empty());
        assert!(decoder.feed(b"1}\n").is_empty());
        let events = decoder.feed(b"\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].event_type(), "message");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_utf8_sequence_split_across_chunks() {
        let bytes = "data: 晴天\n\n".as_bytes();
        // Split inside the first CJK character
        let (a, b) = bytes.split_at(7);
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(a).is_empty());
        let events = decoder.feed(b);
        assert_eq!(events[0].data, "晴天");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\nid: 7\ndata: line one\ndata: line two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "[DONE]");
        assert!(decoder.finish().is_none());
    }
}
