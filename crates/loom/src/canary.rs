//! Canary metadata extraction.
//!
//! A client hook appends a marker-tagged JSON block to the user's message.
//! The block carries session and trace identifiers for the proxy and must
//! never reach the upstream API. Extraction finds the newest block, parses
//! it, and strips every block from the body.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::envelope::is_block;
use crate::error::LoomError;

/// Current canary marker.
pub const DEFAULT_MARKER: &str = "DELIVERATOR_METADATA_UlVCQkVSRFVDSw";

/// Marker emitted by older hooks.
pub const LEGACY_MARKER: &str = "LOOM_METADATA_UlVCQkVSRFVDSw";

/// Line the hook runner puts in front of injected context.
const HOOK_PREAMBLE: &str = "hook additional context:";

/// Metadata carried by the canary block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataRecord {
    /// Client session.
    pub session_id: Option<String>,
    /// Trace the turn belongs to.
    pub trace_id: Option<String>,
    /// W3C parent carrier.
    pub traceparent: Option<String>,
    /// The user's prompt, as typed.
    pub prompt: Option<String>,
    /// Client transcript file.
    pub transcript_path: Option<String>,
    /// Which client produced the request.
    pub source: Option<String>,
    /// The machine the client runs on.
    #[serde(alias = "machine_info")]
    pub machine: Option<MachineInfo>,
    /// Pattern requested by the client.
    pub pattern: Option<String>,
    /// Memories fetched by the hook.
    pub memories: Vec<Memory>,
}

impl MetadataRecord {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Key that groups calls into one turn.
    ///
    /// The explicit trace ID wins; otherwise the trace ID in `traceparent`.
    pub fn turn_key(&self) -> Option<String> {
        if let Some(trace_id) = self.trace_id.as_deref().map(str::trim) {
            if !trace_id.is_empty() {
                return Some(trace_id.to_string());
            }
        }

        let traceparent = self.traceparent.as_deref()?;
        let mut parts = traceparent.trim().split('-');
        let (_version, trace_id) = (parts.next()?, parts.next()?);
        let valid = trace_id.len() == 32
            && trace_id.bytes().all(|b| b.is_ascii_hexdigit())
            && trace_id.bytes().any(|b| b != b'0');
        valid.then(|| trace_id.to_ascii_lowercase())
    }

    /// Fully qualified machine name, if reported.
    pub fn machine_fqdn(&self) -> Option<&str> {
        self.machine
            .as_ref()
            .and_then(|m| m.fqdn.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Machine description reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineInfo {
    /// Fully qualified domain name.
    pub fqdn: Option<String>,
    /// Any other reported fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A memory fetched ahead of the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Memory {
    /// Memory identifier, numeric or string.
    pub id: Option<Value>,
    /// RFC 3339 creation time.
    pub created_at: Option<String>,
    /// Memory text.
    pub content: String,
    /// Query that surfaced the memory.
    pub query: Option<String>,
}

impl Memory {
    /// Build a memory from bare text.
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Render the memory relative to `now`.
    pub fn render(&self, now: DateTime<Local>) -> String {
        let id = match &self.id {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "?".to_string(),
        };
        let when = self
            .created_at
            .as_deref()
            .map_or_else(|| "unknown time".to_string(), |ts| relative_time(ts, now));
        let content = self.content.trim();

        match self.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("\"{query}\": Memory #{id} ({when})\n{content}"),
            None => format!("Memory #{id} ({when}):\n{content}"),
        }
    }
}

/// Human-friendly age of a timestamp. Unparsable input is returned as is.
pub fn relative_time(timestamp: &str, now: DateTime<Local>) -> String {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Local))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .and_then(|naive| Local.from_local_datetime(&naive).single())
        });

    let Some(dt) = parsed else {
        return timestamp.to_string();
    };

    let days = (now.date_naive() - dt.date_naive()).num_days();
    match days {
        i64::MIN..=0 => format!("today at {}", dt.format("%-I:%M %p")),
        1 => format!("yesterday at {}", dt.format("%-I:%M %p")),
        2..=6 => format!("{days} days ago"),
        7..=29 => {
            let weeks = days / 7;
            format!("{weeks} week{} ago", if weeks > 1 { "s" } else { "" })
        }
        _ => dt.format("%a %b %-d %Y").to_string(),
    }
}

/// Result of one extraction pass.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Metadata from the newest block, or empty.
    pub metadata: MetadataRecord,
    /// Number of blocks stripped.
    pub blocks_removed: usize,
    /// Whether any marker was found.
    pub found: bool,
}

/// Finds and strips canary blocks.
#[derive(Debug, Clone)]
pub struct CanaryExtractor {
    markers: Vec<String>,
}

impl Default for CanaryExtractor {
    fn default() -> Self {
        Self::new(vec![DEFAULT_MARKER.to_string(), LEGACY_MARKER.to_string()])
    }
}

impl CanaryExtractor {
    /// Create an extractor recognizing `markers`. Empty markers are ignored.
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }

    /// Recognized markers.
    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Cheap check over raw request bytes.
    pub fn appears_in(&self, raw: &[u8]) -> bool {
        self.markers.iter().any(|marker| {
            let needle = marker.as_bytes();
            raw.windows(needle.len()).any(|window| window == needle)
        })
    }

    /// Extract metadata from the newest block and strip all blocks.
    ///
    /// Only user message text is searched: plain string content and
    /// top-level text blocks. Emptied blocks and messages are removed.
    pub fn extract(&self, body: &mut Value) -> Extraction {
        let mut extraction = Extraction::default();

        let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
            return extraction;
        };

        let mut emptied = Vec::new();
        for idx in (0..messages.len()).rev() {
            let message = &mut messages[idx];
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            let Some(content) = message.get_mut("content") else {
                continue;
            };

            if self.strip_content(content, &mut extraction) && content_is_empty(content) {
                emptied.push(idx);
            }
        }

        // `emptied` is in descending order, so indices stay valid.
        for idx in emptied {
            messages.remove(idx);
            debug!(message = idx, "Removed message emptied by canary stripping");
        }

        extraction
    }

    /// Strip blocks from one message's content. Returns whether anything changed.
    fn strip_content(&self, content: &mut Value, extraction: &mut Extraction) -> bool {
        match content {
            Value::String(text) => self.strip_text(text, extraction),
            Value::Array(blocks) => {
                let mut changed = false;
                for block in blocks.iter_mut() {
                    if !is_block(block, "text") {
                        continue;
                    }
                    if let Some(Value::String(text)) = block.get_mut("text") {
                        changed |= self.strip_text(text, extraction);
                    }
                }
                if changed {
                    blocks.retain(|block| {
                        !is_block(block, "text")
                            || block
                                .get("text")
                                .and_then(Value::as_str)
                                .is_some_and(|t| !t.trim().is_empty())
                    });
                }
                changed
            }
            _ => false,
        }
    }

    /// Strip every block from one text, parsing the first one seen overall.
    fn strip_text(&self, text: &mut String, extraction: &mut Extraction) -> bool {
        let mut changed = false;

        while let Some((pos, marker)) = self.find_marker(text) {
            let span = locate_block(text, pos, marker.len());
            let payload = text[span.payload.clone()].to_string();

            if !extraction.found {
                extraction.found = true;
                extraction.metadata = parse_payload(&payload);
            }

            *text = splice(text, span.start, span.end);
            extraction.blocks_removed += 1;
            changed = true;
        }

        changed
    }

    fn find_marker(&self, text: &str) -> Option<(usize, &str)> {
        self.markers
            .iter()
            .filter_map(|m| text.find(m.as_str()).map(|pos| (pos, m.as_str())))
            .min_by_key(|(pos, _)| *pos)
    }
}

/// Byte ranges of one canary block inside a text.
#[derive(Debug, PartialEq, Eq)]
struct BlockSpan {
    start: usize,
    end: usize,
    payload: std::ops::Range<usize>,
}

/// Locate the block around the marker at `pos`.
///
/// If the marker is a string inside a JSON object, the outermost such object
/// is the block. Otherwise the block runs from the marker to the end of the
/// object that follows it. A hook preamble line in front is included.
///
/// Braces from surrounding user text (code, prose) never count as an
/// enclosing object unless the span between them is valid JSON holding the
/// marker.
fn locate_block(text: &str, pos: usize, marker_len: usize) -> BlockSpan {
    let marker_end = pos + marker_len;
    let marker = &text[pos..marker_end];

    let enclosing = text[..pos]
        .match_indices('{')
        .map(|(open, _)| open)
        .find_map(|open| {
            matching_brace(text, open)
                .filter(|&close| close >= marker_end)
                .filter(|&close| encloses_marker(&text[open..=close], marker))
                .map(|close| (open, close + 1))
        });

    let (start, end, payload) = if let Some((open, end)) = enclosing {
        (open, end, open..end)
    } else if let Some(open) = text[marker_end..].find('{').map(|i| marker_end + i) {
        match matching_brace(text, open) {
            Some(close) => (pos, close + 1, open..close + 1),
            // Unbalanced payload: strip the marker line and report it malformed.
            None => (pos, line_end(text, marker_end), marker_end..marker_end),
        }
    } else {
        let end = line_end(text, marker_end);
        (pos, end, marker_end..marker_end)
    };

    BlockSpan {
        start: include_preamble(text, start),
        end,
        payload,
    }
}

/// Whether `candidate` parses as a JSON object with `marker` in one of its strings.
fn encloses_marker(candidate: &str, marker: &str) -> bool {
    fn holds(value: &Value, marker: &str) -> bool {
        match value {
            Value::String(s) => s.contains(marker),
            Value::Array(items) => items.iter().any(|v| holds(v, marker)),
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| k.contains(marker) || holds(v, marker)),
            _ => false,
        }
    }

    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => holds(&value, marker),
        _ => false,
    }
}

fn line_end(text: &str, from: usize) -> usize {
    text[from..].find('\n').map_or(text.len(), |i| from + i)
}

/// Move `start` back over a preceding hook preamble line.
fn include_preamble(text: &str, start: usize) -> usize {
    let before = text[..start].trim_end();
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let line = &before[line_start..];

    if line.ends_with(HOOK_PREAMBLE) {
        line_start
    } else {
        start
    }
}

/// Index of the brace closing the object opened at `open`.
///
/// Braces inside JSON strings are ignored.
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[open..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/// Remove `start..end`, keeping one separator at the seam.
fn splice(text: &str, start: usize, end: usize) -> String {
    let head = &text[..start];
    let tail = &text[end..];
    let prefix = head.trim_end();
    let suffix = tail.trim_start();

    if prefix.is_empty() || suffix.is_empty() {
        return format!("{prefix}{suffix}");
    }

    let before = &head[prefix.len()..];
    let after = &tail[..tail.len() - suffix.len()];
    let separator = if before.is_empty() { after } else { before };
    format!("{prefix}{separator}{suffix}")
}

fn parse_payload(payload: &str) -> MetadataRecord {
    match serde_json::from_str::<MetadataRecord>(payload) {
        Ok(metadata) => {
            debug!(
                session_id = metadata.session_id.as_deref().unwrap_or("none"),
                memories = metadata.memories.len(),
                "Extracted canary metadata"
            );
            metadata
        }
        Err(e) => {
            let err = LoomError::malformed_metadata(e.to_string());
            warn!(error = %err, "Canary block did not parse; continuing without metadata");
            MetadataRecord::default()
        }
    }
}

fn content_is_empty(content: &Value) -> bool {
    match content {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(blocks) => blocks.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn block(metadata: &Value) -> String {
        format!("UserPromptSubmit hook additional context: {DEFAULT_MARKER}\n{metadata}")
    }

    #[test]
    fn test_no_marker_is_noop() {
        let extractor = CanaryExtractor::default();
        let mut body = json!({"messages": [{"role": "user", "content": "hello"}]});
        let before = body.clone();

        let extraction = extractor.extract(&mut body);
        assert!(!extraction.found);
        assert_eq!(extraction.blocks_removed, 0);
        assert!(extraction.metadata.is_empty());
        assert_eq!(body, before);
    }

    #[test]
    fn test_extracts_and_strips_text_block() {
        let extractor = CanaryExtractor::default();
        let meta = json!({
            "session_id": "abc-123",
            "traceparent": "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "prompt": "what's the weather?",
            "machine": {"fqdn": "alpha-pi.local", "os": "linux"}
        });
        let mut body = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "what's the weather?"},
            {"type": "text", "text": block(&meta)}
        ]}]});

        let extraction = extractor.extract(&mut body);
        assert!(extraction.found);
        assert_eq!(extraction.blocks_removed, 1);
        assert_eq!(extraction.metadata.session_id.as_deref(), Some("abc-123"));
        assert_eq!(extraction.metadata.prompt.as_deref(), Some("what's the weather?"));
        assert_eq!(extraction.metadata.machine_fqdn(), Some("alpha-pi.local"));
        assert_eq!(
            extraction.metadata.turn_key().as_deref(),
            Some("0af7651916cd43dd8448eb211c80319c")
        );
        assert_eq!(
            body,
            json!({"messages": [{"role": "user", "content": [
                {"type": "text", "text": "what's the weather?"}
            ]}]})
        );
    }

    #[test]
    fn test_strips_block_inside_string_content() {
        let extractor = CanaryExtractor::default();
        let meta = json!({"session_id": "s1"});
        let mut body = json!({"messages": [{"role": "user",
            "content": format!("fix the bug\n\n{}\n\nthanks", block(&meta))}]});

        let extraction = extractor.extract(&mut body);
        assert_eq!(extraction.metadata.session_id.as_deref(), Some("s1"));
        assert_eq!(body["messages"][0]["content"], "fix the bug\n\nthanks");
    }

    #[test]
    fn test_marker_inside_object() {
        let extractor = CanaryExtractor::default();
        let text = format!(r#"{{"canary": "{DEFAULT_MARKER}", "session_id": "s2", "trace_id": "t2"}}"#);
        let mut body = json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "user", "content": [{"type": "text", "text": text}]}
        ]});

        let extraction = extractor.extract(&mut body);
        assert_eq!(extraction.metadata.session_id.as_deref(), Some("s2"));
        assert_eq!(extraction.metadata.turn_key().as_deref(), Some("t2"));
        assert_eq!(body, json!({"messages": [{"role": "user", "content": "hi"}]}));
    }

    #[test]
    fn test_user_braces_around_marker_are_kept() {
        let extractor = CanaryExtractor::default();
        let text = format!(
            "fn main() {{\n{DEFAULT_MARKER} {}\n}}\nplease review",
            json!({"session_id": "s"})
        );
        let mut body = json!({"messages": [{"role": "user", "content": text}]});

        let extraction = extractor.extract(&mut body);
        assert_eq!(extraction.metadata.session_id.as_deref(), Some("s"));
        assert_eq!(extraction.blocks_removed, 1);
        assert_eq!(body["messages"][0]["content"], "fn main() {\n}\nplease review");
    }

    #[test]
    fn test_encloses_marker_requires_json_object() {
        assert!(encloses_marker(r#"{"canary": "MARK-1"}"#, "MARK"));
        assert!(encloses_marker(r#"{"a": {"b": ["xMARKx"]}}"#, "MARK"));
        assert!(!encloses_marker("{ let x = MARK; }", "MARK"));
        assert!(!encloses_marker(r#"{"canary": "other"}"#, "MARK"));
    }

    #[test]
    fn test_newest_block_wins_and_all_are_stripped() {
        let extractor = CanaryExtractor::default();
        let old = block(&json!({"session_id": "old"}));
        let new = format!("{LEGACY_MARKER} {}", json!({"session_id": "new"}));
        let mut body = json!({"messages": [
            {"role": "user", "content": [{"type": "text", "text": "one"}, {"type": "text", "text": old}]},
            {"role": "assistant", "content": "ok"},
            {"role": "user", "content": [{"type": "text", "text": "two"}, {"type": "text", "text": new}]}
        ]});

        let extraction = extractor.extract(&mut body);
        assert_eq!(extraction.metadata.session_id.as_deref(), Some("new"));
        assert_eq!(extraction.blocks_removed, 2);
        assert!(!body.to_string().contains("METADATA_UlVCQkVSRFVDSw"));
        assert_eq!(body["messages"][0]["content"], json!([{"type": "text", "text": "one"}]));
    }

    #[test]
    fn test_malformed_payload_degrades_to_empty() {
        let extractor = CanaryExtractor::default();
        let mut body = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "hello"},
            {"type": "text", "text": format!("{DEFAULT_MARKER} {{\"session_id\": 42}}")}
        ]}]});

        let extraction = extractor.extract(&mut body);
        assert!(extraction.found);
        assert!(extraction.metadata.is_empty());
        assert_eq!(extraction.blocks_removed, 1);
        assert_eq!(body["messages"][0]["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_unbalanced_payload_strips_marker_line() {
        let extractor = CanaryExtractor::default();
        let mut body = json!({"messages": [{"role": "user",
            "content": format!("keep me\n{DEFAULT_MARKER} {{\"session_id\": \"x\"\nand me")}]});

        let extraction = extractor.extract(&mut body);
        assert!(extraction.metadata.is_empty());
        assert_eq!(body["messages"][0]["content"], "keep me\nand me");
    }

    #[test]
    fn test_assistant_and_tool_results_are_not_searched() {
        let extractor = CanaryExtractor::default();
        let mention = format!("the marker is {DEFAULT_MARKER} {{}}");
        let mut body = json!({"messages": [
            {"role": "assistant", "content": mention.clone()},
            {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t", "content": mention}]}
        ]});
        let before = body.clone();

        let extraction = extractor.extract(&mut body);
        assert!(!extraction.found);
        assert_eq!(body, before);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let extractor = CanaryExtractor::default();
        let mut body = json!({"messages": [{"role": "user",
            "content": format!("hi {}", block(&json!({"session_id": "s"})))}]});

        extractor.extract(&mut body);
        let stripped = body.clone();
        let second = extractor.extract(&mut body);

        assert!(!second.found);
        assert_eq!(body, stripped);
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"prompt": "use } and { freely", "session_id": "s"} tail"#;
        assert_eq!(matching_brace(text, 0), Some(text.find(" tail").unwrap() - 1));
    }

    #[test]
    fn test_splice_keeps_one_separator() {
        assert_eq!(splice("a \n[x]\n b", 3, 6), "a \nb");
        assert_eq!(splice("[x] rest", 0, 3), "rest");
        assert_eq!(splice("start [x]", 6, 9), "start");
    }

    #[test]
    fn test_relative_time() {
        let now = Local.with_ymd_and_hms(2026, 1, 26, 18, 0, 0).unwrap();
        let at = |d: u32, h: u32| {
            Local
                .with_ymd_and_hms(2026, 1, d, h, 0, 0)
                .unwrap()
                .to_rfc3339()
        };

        assert_eq!(relative_time(&at(26, 15), now), "today at 3:00 PM");
        assert_eq!(relative_time(&at(25, 10), now), "yesterday at 10:00 AM");
        assert_eq!(relative_time(&at(20, 12), now), "6 days ago");
        assert_eq!(relative_time(&at(12, 12), now), "2 weeks ago");
        assert_eq!(relative_time(&at(1, 12), now), "3 weeks ago");
        assert_eq!(relative_time("2025-12-15T08:00:00", now), "Mon Dec 15 2025");
        assert_eq!(relative_time("last tuesday", now), "last tuesday");
    }

    #[test]
    fn test_memory_render() {
        let now = Local.with_ymd_and_hms(2026, 1, 26, 18, 0, 0).unwrap();
        let memory = Memory {
            id: Some(json!(42)),
            created_at: Some("2025-12-15T08:00:00".to_string()),
            content: "  Sparkle stole bread.  ".to_string(),
            query: Some("sparkle".to_string()),
        };
        assert_eq!(
            memory.render(now),
            "\"sparkle\": Memory #42 (Mon Dec 15 2025)\nSparkle stole bread."
        );

        let bare = Memory::from_text("hello");
        assert_eq!(bare.render(now), "Memory #? (unknown time):\nhello");
    }

    proptest! {
        #[test]
        fn test_marker_free_bodies_are_untouched(
            texts in proptest::collection::vec("[a-zA-Z0-9 {}\":,\\n]{0,64}", 1..6)
        ) {
            let extractor = CanaryExtractor::default();
            let messages: Vec<Value> = texts
                .iter()
                .map(|t| json!({"role": "user", "content": [{"type": "text", "text": t}]}))
                .collect();
            let mut body = json!({"model": "m", "messages": messages});
            let before = body.clone();

            let raw = serde_json::to_vec(&body).unwrap();
            prop_assert!(!extractor.appears_in(&raw));

            let extraction = extractor.extract(&mut body);
            prop_assert!(!extraction.found);
            prop_assert_eq!(body, before);
        }
    }
}
