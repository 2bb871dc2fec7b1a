//! Debug pattern for checking what the model actually receives.
//!
//! Inserts configured prompt files as one system block, swaps the
//! post-compaction continuation for a verification text, and tags the
//! response so the client can tell the probe was active.

use std::path::PathBuf;

use http::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{BoxFuture, Pattern, PatternId, RequestContext};
use crate::compact::{CompactPhase, CompactPhases, CompactPrompts, CompactRewriter};
use crate::config::ProbeSettings;
use crate::envelope::RequestEnvelope;
use crate::error::{LoomError, LoomResult};
use crate::headers::HEADER_PROBE;

const DEFAULT_CONTINUATION: &str = "Before continuing, state which pattern you believe is active and what you were last asked to do, then wait.";

/// Debug pattern.
#[derive(Debug, Clone)]
pub struct ProbePattern {
    prompt: Option<String>,
    rewriter: CompactRewriter,
}

impl ProbePattern {
    /// Create a probe with an inline prompt and continuation text.
    pub fn new(prompt: Option<String>, continuation: Option<String>) -> Self {
        let prompts = CompactPrompts {
            check_in: continuation.unwrap_or_else(|| DEFAULT_CONTINUATION.to_string()),
            ..Default::default()
        };

        Self {
            prompt: prompt.filter(|p| !p.trim().is_empty()),
            rewriter: CompactRewriter::with_phases(
                prompts,
                CompactPhases::only(CompactPhase::Continuation),
            ),
        }
    }

    /// Build from settings, reading the prompt files.
    ///
    /// Unreadable files fail startup; a probe with half its prompt is
    /// worse than none.
    pub fn from_settings(settings: &ProbeSettings) -> LoomResult<Self> {
        let prompt = read_prompts(&settings.prompt_paths)?;
        Ok(Self::new(prompt, settings.continuation_text.clone()))
    }
}

fn read_prompts(paths: &[PathBuf]) -> LoomResult<Option<String>> {
    let mut parts = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoomError::config(format!("cannot read probe prompt {}: {e}", path.display()))
        })?;
        parts.push(text.trim().to_string());
    }

    Ok((!parts.is_empty()).then(|| parts.join("\n\n")))
}

/// Insert `text` as system element 1, converting a string system first.
fn insert_system_block(body: &mut Value, text: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let block = json!({"type": "text", "text": text});

    let system = obj.entry("system").or_insert(Value::Null);
    if let Value::String(existing) = system {
        let original = json!({"type": "text", "text": std::mem::take(existing)});
        *system = Value::Array(vec![original]);
    }

    match system {
        Value::Array(existing) => {
            let at = existing.len().min(1);
            existing.insert(at, block);
        }
        other => {
            if !other.is_null() {
                warn!("Unexpected system format; replacing it");
            }
            *other = Value::Array(vec![block]);
        }
    }
}

impl Pattern for ProbePattern {
    fn id(&self) -> PatternId {
        PatternId::Probe
    }

    fn transform_request<'a>(
        &'a self,
        ctx: &'a RequestContext,
        envelope: &'a mut RequestEnvelope,
    ) -> BoxFuture<'a, LoomResult<()>> {
        Box::pin(async move {
            envelope.modify(|body| {
                let mut changed = false;
                if let Some(prompt) = &self.prompt {
                    insert_system_block(body, prompt);
                    changed = true;
                }
                changed |= !self.rewriter.apply(body).is_empty();
                changed
            });

            debug!(request_id = %ctx.request_id, "Probe applied");
            Ok(())
        })
    }

    fn transform_response(
        &self,
        _ctx: &RequestContext,
        headers: &mut HeaderMap,
        _body: Option<&mut Value>,
    ) -> LoomResult<()> {
        headers.insert(HEADER_PROBE.clone(), HeaderValue::from_static("1"));
        Ok(())
    }
}
