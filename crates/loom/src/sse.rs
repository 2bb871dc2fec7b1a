//! Observation of Anthropic message responses.
//!
//! [`SseDecoder`] reads a copy of the streamed bytes and keeps a running
//! [`StreamSummary`]; it never sees the buffer that goes to the client.
//! [`summarize_message`] does the same for a whole JSON response.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Longest partial line held while waiting for its newline.
const MAX_PENDING_LINE: usize = 4 * 1024 * 1024;

/// What a response said, as far as turns and spans care.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// Concatenated assistant text.
    pub text: String,
    /// Uncached input tokens.
    pub input_tokens: u64,
    /// Output tokens (the last cumulative count reported).
    pub output_tokens: u64,
    /// Input tokens read from cache.
    pub cache_read_tokens: u64,
    /// Input tokens written to cache.
    pub cache_creation_tokens: u64,
    /// Names of tools the model invoked.
    pub tool_uses: Vec<String>,
    /// Why the model stopped.
    pub stop_reason: Option<String>,
    /// Model that answered.
    pub model: Option<String>,
    /// Whether the terminal event was seen.
    pub completed: bool,
    /// Error reported in-band.
    pub error: Option<String>,
}

impl StreamSummary {
    /// Whether the model asked for a tool, so the client will call again.
    pub fn has_tool_use(&self) -> bool {
        !self.tool_uses.is_empty() || self.stop_reason.as_deref() == Some("tool_use")
    }

    fn apply_usage(&mut self, usage: &Value) {
        let count = |key: &str| usage.get(key).and_then(Value::as_u64);
        if let Some(n) = count("input_tokens") {
            self.input_tokens = n;
        }
        if let Some(n) = count("output_tokens") {
            self.output_tokens = n;
        }
        if let Some(n) = count("cache_read_input_tokens") {
            self.cache_read_tokens = n;
        }
        if let Some(n) = count("cache_creation_input_tokens") {
            self.cache_creation_tokens = n;
        }
    }

    fn apply_error(&mut self, event: &Value) {
        let message = event
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error");
        self.error = Some(message.to_string());
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Tolerates events split across chunks at any byte and CRLF line endings.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
    events: usize,
    overflowed: bool,
    summary: StreamSummary,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }

        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            self.line(&buf[start..end]);
            start = end + 1;
        }
        buf.drain(..start);

        if buf.len() > MAX_PENDING_LINE {
            warn!(
                pending = buf.len(),
                "SSE line too long; stopping observation"
            );
            self.overflowed = true;
            buf = Vec::new();
        }
        self.pending = buf;
    }

    /// Number of events dispatched so far.
    pub fn events(&self) -> usize {
        self.events
    }

    /// The running summary.
    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    /// Flush any unterminated event and return the summary.
    pub fn finish(mut self) -> StreamSummary {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.line(&pending);
        }
        self.dispatch();
        self.summary
    }

    fn line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(b":") {
            return;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        let name = self.event.take();
        if !self.has_data {
            return;
        }
        let data = std::mem::take(&mut self.data);
        self.has_data = false;
        self.events += 1;

        let Ok(event) = serde_json::from_str::<Value>(&data) else {
            debug!(event = name.as_deref().unwrap_or(""), "Skipping non-JSON SSE data");
            return;
        };
        let kind = event
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(name)
            .unwrap_or_default();

        let summary = &mut self.summary;
        match kind.as_str() {
            "message_start" => {
                if let Some(message) = event.get("message") {
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        summary.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        summary.apply_usage(usage);
                    }
                }
            }
            "content_block_start" => {
                let block = event.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                    let name = block
                        .and_then(|b| b.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    summary.tool_uses.push(name.to_string());
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(Value::as_str) == Some("text_delta") {
                    if let Some(text) = delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                        summary.text.push_str(text);
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    summary.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = event.get("usage") {
                    summary.apply_usage(usage);
                }
            }
            "message_stop" => summary.completed = true,
            "error" => summary.apply_error(&event),
            _ => {}
        }
    }
}

/// Summarize a complete (non-streaming) message response.
pub fn summarize_message(body: &Value) -> StreamSummary {
    let mut summary = StreamSummary::default();

    if body.get("type").and_then(Value::as_str) == Some("error") {
        summary.apply_error(body);
        return summary;
    }

    summary.model = body.get("model").and_then(Value::as_str).map(str::to_string);
    summary.stop_reason = body
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(usage) = body.get("usage") {
        summary.apply_usage(usage);
    }

    for block in body
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    summary.text.push_str(text);
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("unknown");
                summary.tool_uses.push(name.to_string());
            }
            _ => {}
        }
    }

    summary.completed = true;
    summary
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-x\",\"usage\":{\"input_tokens\":12,\"cache_read_input_tokens\":3,\"output_tokens\":1}}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", wörld\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}\n\n",
        ": keepalive\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    fn expected() -> StreamSummary {
        StreamSummary {
            text: "Hello, wörld".to_string(),
            input_tokens: 12,
            output_tokens: 7,
            cache_read_tokens: 3,
            stop_reason: Some("end_turn".to_string()),
            model: Some("claude-x".to_string()),
            completed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_whole_stream() {
        let mut decoder = SseDecoder::new();
        decoder.feed(STREAM.as_bytes());
        assert_eq!(decoder.events(), 7);
        assert_eq!(decoder.finish(), expected());
    }

    #[test]
    fn test_split_at_every_byte() {
        let mut decoder = SseDecoder::new();
        for byte in STREAM.as_bytes() {
            decoder.feed(std::slice::from_ref(byte));
        }
        let summary = decoder.finish();
        assert_eq!(summary, expected());
        assert!(!summary.has_tool_use());
    }

    #[test]
    fn test_crlf_line_endings() {
        let crlf = STREAM.replace('\n', "\r\n");
        let mut decoder = SseDecoder::new();
        for chunk in crlf.as_bytes().chunks(5) {
            decoder.feed(chunk);
        }
        assert_eq!(decoder.finish(), expected());
    }

    #[test]
    fn test_tool_use_detected() {
        let stream = concat!(
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"Bash\",\"input\":{}}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":30}}\n\n",
        );
        let mut decoder = SseDecoder::new();
        decoder.feed(stream.as_bytes());
        let summary = decoder.finish();

        assert!(summary.has_tool_use());
        assert_eq!(summary.tool_uses, vec!["Bash".to_string()]);
        assert!(!summary.completed);
    }

    #[test]
    fn test_error_event_and_unterminated_tail() {
        let stream = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}";
        let mut decoder = SseDecoder::new();
        decoder.feed(stream.as_bytes());
        assert!(decoder.summary().error.is_none());

        let summary = decoder.finish();
        assert_eq!(summary.error.as_deref(), Some("Overloaded"));
    }

    #[test]
    fn test_multiline_data_and_garbage() {
        let stream = "data: {\"type\":\ndata: \"message_stop\"}\n\ndata: not json\n\n";
        let mut decoder = SseDecoder::new();
        decoder.feed(stream.as_bytes());
        assert_eq!(decoder.events(), 2);
        assert!(decoder.finish().completed);
    }

    #[test]
    fn test_summarize_message() {
        let body = json!({
            "type": "message",
            "model": "claude-x",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 40, "output_tokens": 9}
        });

        let summary = summarize_message(&body);
        assert_eq!(summary.text, "Let me check.");
        assert_eq!(summary.tool_uses, vec!["Read".to_string()]);
        assert_eq!(summary.input_tokens, 40);
        assert_eq!(summary.output_tokens, 9);
        assert!(summary.has_tool_use());

        let error = summarize_message(&json!({"type": "error", "error": {"message": "bad"}}));
        assert_eq!(error.error.as_deref(), Some("bad"));
        assert!(!error.completed);
    }
}
