//! The no-op pattern.

use super::{BoxFuture, Pattern, PatternId, RequestContext};
use crate::envelope::RequestEnvelope;
use crate::error::LoomResult;

/// Forwards requests and responses untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPattern;

impl Pattern for PassthroughPattern {
    fn id(&self) -> PatternId {
        PatternId::Passthrough
    }

    fn transform_request<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        _envelope: &'a mut RequestEnvelope,
    ) -> BoxFuture<'a, LoomResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;

    #[tokio::test]
    async fn test_passthrough_keeps_bytes() {
        let raw = Bytes::from_static(br#"{"model": "m", "messages": [{"role":"user","content":"hi"}]}"#);
        let mut envelope =
            RequestEnvelope::new(Method::POST, "/v1/messages", HeaderMap::new(), raw.clone());
        let ctx = RequestContext::new("req-1", Arc::default());

        PassthroughPattern
            .transform_request(&ctx, &mut envelope)
            .await
            .unwrap();

        assert_eq!(PassthroughPattern.name(), "passthrough");
        assert_eq!(envelope.into_body_bytes().unwrap(), raw);
    }
}
