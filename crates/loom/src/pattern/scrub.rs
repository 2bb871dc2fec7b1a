//! Removal of client reminder noise from user messages.
//!
//! Exact matches only for invariant blocks; anchored patterns for reminders
//! with variable content. A false positive on real conversation is worse
//! than leaving noise in.

use regex::Regex;
use serde_json::{json, Value};
use tracing::info;

use crate::envelope::{is_block, visit_texts_mut, Role};
use crate::error::{LoomError, LoomResult};

/// Blocks removed when their text matches exactly.
const EXACT_NOISE: &[&str] = &[
    "<system-reminder>\nUserPromptSubmit hook success: Success\n</system-reminder>",
    "<system-reminder>\nSessionStart:startup hook success: Success\n</system-reminder>",
];

/// Reminders removed wherever they appear in user text.
const NOISE_PATTERNS: &[&str] = &[
    r"(?s)<system-reminder>\s*The TodoWrite tool hasn't been used recently\..*?Make sure that you NEVER mention this reminder to the user\s*</system-reminder>",
    r"(?s)<system-reminder>\s*Whenever you read a file, you should consider whether it would be considered malware\..*?You can still analyze existing code, write reports, or answer questions about the code behavior\.\s*</system-reminder>",
    r"(?s)<system-reminder>\s*Note: .+? was modified, either by the user or by a linter\..*?Here are the relevant changes \(shown with line numbers\):.*?</system-reminder>",
];

/// What a scrub pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubStats {
    /// Whole blocks removed.
    pub blocks_removed: usize,
    /// Texts with reminders cut out.
    pub texts_cleaned: usize,
}

impl ScrubStats {
    /// Whether anything changed.
    pub const fn changed(self) -> bool {
        self.blocks_removed > 0 || self.texts_cleaned > 0
    }
}

/// Removes known noise from user messages.
#[derive(Debug, Clone)]
pub struct NoiseScrubber {
    patterns: Vec<Regex>,
    exact: Vec<Value>,
}

impl NoiseScrubber {
    /// Compile the noise patterns.
    pub fn new() -> LoomResult<Self> {
        let patterns = NOISE_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LoomError::internal(format!("invalid noise pattern: {e}")))?;
        let exact = EXACT_NOISE
            .iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect();

        Ok(Self { patterns, exact })
    }

    /// Scrub a request body in place.
    pub fn scrub(&self, body: &mut Value) -> ScrubStats {
        let mut stats = ScrubStats::default();

        visit_texts_mut(body, |site, text| {
            if site.role != Role::User {
                return;
            }
            let mut changed = false;
            for pattern in &self.patterns {
                if pattern.is_match(text) {
                    *text = pattern.replace_all(text, "").into_owned();
                    changed = true;
                }
            }
            if changed {
                stats.texts_cleaned += 1;
            }
        });

        let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
            return stats;
        };

        for message in messages {
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) else {
                continue;
            };

            let before = blocks.len();
            blocks.retain(|block| !self.exact.contains(block) && !is_empty_text(block));
            stats.blocks_removed += before - blocks.len();
        }

        if stats.changed() {
            info!(
                blocks_removed = stats.blocks_removed,
                texts_cleaned = stats.texts_cleaned,
                "Scrubbed noise"
            );
        }

        stats
    }
}

fn is_empty_text(block: &Value) -> bool {
    is_block(block, "text")
        && block
            .get("text")
            .and_then(Value::as_str)
            .map_or(true, |t| t.trim().is_empty())
}
