//! Header handling between the client, the proxy and the upstream API.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

/// Header naming the pattern for one request. Never forwarded upstream.
pub static HEADER_PATTERN: HeaderName = HeaderName::from_static("x-loom-pattern");

/// Header name for request ID.
pub static HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Header carrying the client session upstream.
pub static HEADER_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

/// Response header set by the probe pattern.
pub static HEADER_PROBE: HeaderName = HeaderName::from_static("x-loom-probe");

/// Prefix of proxy-internal headers.
const INTERNAL_PREFIX: &str = "x-loom-";

/// Hop-by-hop headers (RFC 9110 section 7.6.1).
pub static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Request headers recomputed by the client library or the proxy.
///
/// `accept-encoding` is dropped so the upstream answers in identity
/// encoding and the event stream stays observable.
static RECOMPUTED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "accept-encoding"];

/// Response headers that no longer describe the relayed body.
static RECOMPUTED_RESPONSE_HEADERS: &[&str] = &["content-length", "content-encoding"];

/// Check if a header is hop-by-hop.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Filter inbound headers for forwarding upstream.
///
/// Repeated headers keep every value.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let key = name.as_str();
        if is_hop_by_hop_header(key)
            || RECOMPUTED_REQUEST_HEADERS.contains(&key)
            || key.starts_with(INTERNAL_PREFIX)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}

/// Filter upstream response headers for relaying to the client.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let key = name.as_str();
        if is_hop_by_hop_header(key) || RECOMPUTED_RESPONSE_HEADERS.contains(&key) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}

/// Read a header as a trimmed, non-empty string.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Headers the proxy sets on the upstream request.
#[derive(Debug, Clone)]
pub struct PropagatedHeaders {
    /// Request ID for correlation.
    pub request_id: String,
    /// Session the request belongs to, from metadata.
    pub session_id: Option<String>,
}

impl PropagatedHeaders {
    /// Use the client's request ID, or generate one.
    pub fn from_inbound(headers: &HeaderMap) -> Self {
        let request_id = header_str(headers, &HEADER_REQUEST_ID)
            .map_or_else(|| Uuid::now_v7().to_string(), String::from);

        Self {
            request_id,
            session_id: None,
        }
    }

    /// Set the session ID.
    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<impl Into<String>>) -> Self {
        self.session_id = session_id.map(Into::into);
        self
    }

    /// Add the propagated headers to a header map.
    pub fn add_to_headers(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(HEADER_REQUEST_ID.clone(), value);
        }

        if let Some(ref session_id) = self.session_id {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert(HEADER_SESSION_ID.clone(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("x-api-key"));
    }

    #[test]
    fn test_filter_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-test"));
        headers.insert("host", HeaderValue::from_static("localhost:8080"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert(&HEADER_PATTERN, HeaderValue::from_static("identity"));
        headers.append("anthropic-beta", HeaderValue::from_static("a"));
        headers.append("anthropic-beta", HeaderValue::from_static("b"));

        let filtered = filter_request_headers(&headers);
        assert!(filtered.contains_key("content-type"));
        assert!(filtered.contains_key("x-api-key"));
        assert!(!filtered.contains_key("host"));
        assert!(!filtered.contains_key("content-length"));
        assert!(!filtered.contains_key("accept-encoding"));
        assert!(!filtered.contains_key("connection"));
        assert!(!filtered.contains_key(&HEADER_PATTERN));
        assert_eq!(filtered.get_all("anthropic-beta").iter().count(), 2);
    }

    #[test]
    fn test_filter_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("content-length", HeaderValue::from_static("10"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("request-id", HeaderValue::from_static("req_01"));

        let filtered = filter_response_headers(&headers);
        assert!(filtered.contains_key("content-type"));
        assert!(filtered.contains_key("request-id"));
        assert!(!filtered.contains_key("content-length"));
        assert!(!filtered.contains_key("content-encoding"));
        assert!(!filtered.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_propagated_headers_generate_request_id() {
        let propagated = PropagatedHeaders::from_inbound(&HeaderMap::new());
        assert_eq!(propagated.request_id.len(), 36);
        assert!(propagated.session_id.is_none());
    }

    #[test]
    fn test_propagated_headers_keep_client_request_id() {
        let mut inbound = HeaderMap::new();
        inbound.insert(&HEADER_REQUEST_ID, HeaderValue::from_static("req-123"));

        let propagated =
            PropagatedHeaders::from_inbound(&inbound).with_session_id(Some("session-abc"));

        let mut headers = HeaderMap::new();
        propagated.add_to_headers(&mut headers);

        assert_eq!(headers.get(&HEADER_REQUEST_ID).unwrap(), "req-123");
        assert_eq!(headers.get(&HEADER_SESSION_ID).unwrap(), "session-abc");
    }

    #[test]
    fn test_header_str() {
        let mut headers = HeaderMap::new();
        headers.insert(&HEADER_PATTERN, HeaderValue::from_static("  probe "));
        assert_eq!(header_str(&headers, &HEADER_PATTERN), Some("probe"));

        headers.insert(&HEADER_PATTERN, HeaderValue::from_static(""));
        assert_eq!(header_str(&headers, &HEADER_PATTERN), None);
    }
}
