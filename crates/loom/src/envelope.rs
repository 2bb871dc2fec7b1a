//! The mutable view of one outbound request.
//!
//! The envelope keeps the raw bytes next to the parsed body. As long as
//! nothing edits the body, the bytes sent upstream are the bytes received.

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;

use crate::canary::{CanaryExtractor, MetadataRecord};
use crate::error::LoomResult;

/// Author of a piece of prompt text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The `system` field.
    System,
    /// A user message.
    User,
    /// An assistant message.
    Assistant,
}

impl Role {
    fn from_message(message: &Value) -> Option<Self> {
        match message.get("role").and_then(Value::as_str) {
            Some("user") => Some(Self::User),
            Some("assistant") => Some(Self::Assistant),
            Some("system") => Some(Self::System),
            _ => None,
        }
    }
}

/// Where a visited text lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSite {
    /// Author of the text.
    pub role: Role,
    /// Index into `messages`, `None` for the system field.
    pub message: Option<usize>,
    /// Whether the text belongs to the newest user message.
    pub last_user: bool,
    /// Whether the text is nested inside a `tool_result` block.
    pub nested: bool,
}

/// Request headers and body as seen by patterns.
#[derive(Debug)]
pub struct RequestEnvelope {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Value>,
    raw: Bytes,
    dirty: bool,
}

impl RequestEnvelope {
    /// Wrap an inbound request. Bodies that are not JSON objects stay opaque.
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, raw: Bytes) -> Self {
        let body = serde_json::from_slice::<Value>(&raw)
            .ok()
            .filter(Value::is_object);

        Self {
            method,
            path: path.into(),
            headers,
            body,
            raw,
            dirty: false,
        }
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path and query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Inbound headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable inbound headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Parsed body, if it is a JSON object.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Mutable body. Marks the envelope as edited.
    pub fn body_mut(&mut self) -> Option<&mut Value> {
        if self.body.is_some() {
            self.dirty = true;
        }
        self.body.as_mut()
    }

    /// Run an edit that reports whether it changed anything.
    ///
    /// The envelope is only marked edited when `f` returns `true`.
    pub fn modify<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut Value) -> bool,
    {
        let Some(body) = self.body.as_mut() else {
            return false;
        };
        let changed = f(body);
        self.dirty |= changed;
        changed
    }

    /// Whether the body is a JSON object.
    pub fn is_json(&self) -> bool {
        self.body.is_some()
    }

    /// Whether the body has been edited.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the client asked for a streamed response.
    pub fn is_streaming(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Requested model name.
    pub fn model(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.get("model"))
            .and_then(Value::as_str)
    }

    /// Find, parse, and strip canary blocks.
    ///
    /// Bodies that do not contain a marker are not touched at all.
    pub fn extract_canary(&mut self, extractor: &CanaryExtractor) -> MetadataRecord {
        if !extractor.appears_in(&self.raw) {
            return MetadataRecord::default();
        }

        let Some(body) = self.body.as_mut() else {
            return MetadataRecord::default();
        };

        let extraction = extractor.extract(body);
        if extraction.blocks_removed > 0 {
            self.dirty = true;
        }
        extraction.metadata
    }

    /// Bytes to send upstream.
    pub fn into_body_bytes(self) -> LoomResult<Bytes> {
        match self.body {
            Some(body) if self.dirty => Ok(Bytes::from(serde_json::to_vec(&body)?)),
            _ => Ok(self.raw),
        }
    }

    /// Split into method, path, headers and upstream body bytes.
    pub fn into_parts(self) -> LoomResult<(Method, String, HeaderMap, Bytes)> {
        let method = self.method.clone();
        let path = self.path.clone();
        let headers = self.headers.clone();
        let bytes = self.into_body_bytes()?;
        Ok((method, path, headers, bytes))
    }
}

/// Index of the newest user message.
pub fn last_user_index(body: &Value) -> Option<usize> {
    body.get("messages")?
        .as_array()?
        .iter()
        .rposition(|m| Role::from_message(m) == Some(Role::User))
}

/// Visit every prompt text mutably.
///
/// Covers `system` (string or text blocks) and message content (string,
/// text blocks, and text nested in `tool_result` blocks).
pub fn visit_texts_mut<F>(body: &mut Value, mut f: F)
where
    F: FnMut(TextSite, &mut String),
{
    let last_user = last_user_index(body);

    if let Some(system) = body.get_mut("system") {
        let site = TextSite {
            role: Role::System,
            message: None,
            last_user: false,
            nested: false,
        };
        visit_content_mut(system, site, &mut f);
    }

    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for (idx, message) in messages.iter_mut().enumerate() {
            let Some(role) = Role::from_message(message) else {
                continue;
            };
            let site = TextSite {
                role,
                message: Some(idx),
                last_user: Some(idx) == last_user,
                nested: false,
            };
            if let Some(content) = message.get_mut("content") {
                visit_content_mut(content, site, &mut f);
            }
        }
    }
}

fn visit_content_mut<F>(content: &mut Value, site: TextSite, f: &mut F)
where
    F: FnMut(TextSite, &mut String),
{
    match content {
        Value::String(text) => f(site, text),
        Value::Array(blocks) => {
            for block in blocks {
                if is_block(block, "text") {
                    if let Some(Value::String(text)) = block.get_mut("text") {
                        f(site, text);
                    }
                } else if is_block(block, "tool_result") {
                    if let Some(inner) = block.get_mut("content") {
                        let nested = TextSite {
                            nested: true,
                            ..site
                        };
                        visit_content_mut(inner, nested, f);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Whether a content block has the given `type`.
pub fn is_block(block: &Value, kind: &str) -> bool {
    block.get("type").and_then(Value::as_str) == Some(kind)
}

/// Visit every prompt text.
pub fn visit_texts<F>(body: &Value, mut f: F)
where
    F: FnMut(TextSite, &str),
{
    let last_user = last_user_index(body);

    if let Some(system) = body.get("system") {
        let site = TextSite {
            role: Role::System,
            message: None,
            last_user: false,
            nested: false,
        };
        visit_content(system, site, &mut f);
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for (idx, message) in messages.iter().enumerate() {
            let Some(role) = Role::from_message(message) else {
                continue;
            };
            let site = TextSite {
                role,
                message: Some(idx),
                last_user: Some(idx) == last_user,
                nested: false,
            };
            if let Some(content) = message.get("content") {
                visit_content(content, site, &mut f);
            }
        }
    }
}

fn visit_content<F>(content: &Value, site: TextSite, f: &mut F)
where
    F: FnMut(TextSite, &str),
{
    match content {
        Value::String(text) => f(site, text),
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            f(site, text);
                        }
                    }
                    Some("tool_result") => {
                        if let Some(inner) = block.get("content") {
                            visit_content(inner, TextSite { nested: true, ..site }, f);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(body: &Value) -> RequestEnvelope {
        RequestEnvelope::new(
            Method::POST,
            "/v1/messages",
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(body).unwrap()),
        )
    }

    #[test]
    fn test_clean_envelope_keeps_raw_bytes() {
        let raw = Bytes::from_static(br#"{"model":"m",  "messages":[]}"#);
        let env = RequestEnvelope::new(Method::POST, "/v1/messages", HeaderMap::new(), raw.clone());

        assert!(env.is_json());
        assert_eq!(env.model(), Some("m"));
        assert_eq!(env.into_body_bytes().unwrap(), raw);
    }

    #[test]
    fn test_edited_envelope_reserializes() {
        let mut env = envelope(&json!({"model": "m", "stream": true}));
        assert!(env.is_streaming());

        env.body_mut().unwrap()["model"] = json!("other");
        assert!(env.is_dirty());

        let bytes = env.into_body_bytes().unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["model"], "other");
    }

    #[test]
    fn test_modify_only_dirties_on_change() {
        let mut env = envelope(&json!({"model": "m"}));
        assert!(!env.modify(|_| false));
        assert!(!env.is_dirty());
        assert!(env.modify(|b| {
            b["model"] = json!("n");
            true
        }));
        assert!(env.is_dirty());
    }

    #[test]
    fn test_non_json_body_is_opaque() {
        let raw = Bytes::from_static(b"not json");
        let mut env = RequestEnvelope::new(Method::POST, "/x", HeaderMap::new(), raw.clone());

        assert!(!env.is_json());
        assert!(env.body_mut().is_none());
        assert_eq!(env.into_body_bytes().unwrap(), raw);
    }

    #[test]
    fn test_visit_texts_covers_all_shapes() {
        let body = json!({
            "system": [{"type": "text", "text": "sys"}],
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": [{"type": "text", "text": "reply"}]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t", "content": [{"type": "text", "text": "nested"}]},
                    {"type": "image", "source": {}},
                    {"type": "text", "text": "last"}
                ]}
            ]
        });

        let mut seen = Vec::new();
        visit_texts(&body, |site, text| seen.push((site.role, site.last_user, site.nested, text.to_string())));

        assert_eq!(
            seen,
            vec![
                (Role::System, false, false, "sys".to_string()),
                (Role::User, false, false, "first".to_string()),
                (Role::Assistant, false, false, "reply".to_string()),
                (Role::User, true, true, "nested".to_string()),
                (Role::User, true, false, "last".to_string()),
            ]
        );
    }

    #[test]
    fn test_visit_texts_mut_edits_in_place() {
        let mut body = json!({
            "system": "sys",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        });

        visit_texts_mut(&mut body, |site, text| {
            if site.role == Role::User {
                text.push('!');
            }
        });

        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi!");
    }

    #[test]
    fn test_last_user_index() {
        let body = json!({"messages": [
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"}
        ]});
        assert_eq!(last_user_index(&body), Some(0));
        assert_eq!(last_user_index(&json!({})), None);
    }
}
