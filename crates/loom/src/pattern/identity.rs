//! The identity-composing pattern.
//!
//! Weaves four system blocks around the client's own system prompt:
//!
//! - `<eternal>`: the identity's core prompt
//! - `<past>`: summaries of earlier periods
//! - `<present>`: the machine and the weather
//! - `<future>`: calendar and todos
//!
//! Memories are appended to the user's newest text, the session's
//! memorables follow as an `<intro>` block, and compaction requests are
//! rewritten to the identity's own prompts.

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use http::HeaderMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BoxFuture, NoiseScrubber, Pattern, PatternId, RequestContext};
use crate::canary::{Memory, MetadataRecord};
use crate::collab::{ContextSections, ContextSource, MemorablesSource, MemoryLookup, NoMemorables};
use crate::compact::{CompactPhase, CompactPrompts, CompactRewriter};
use crate::config::IdentitySettings;
use crate::envelope::{is_block, RequestEnvelope};
use crate::error::LoomResult;
use crate::headers::header_str;

/// Header some clients use to report the machine name.
static HEADER_MACHINE_NAME: http::HeaderName = http::HeaderName::from_static("x-machine-name");

const FALLBACK_SOUL: &str = "You are a persistent identity. You remember, you care, and you speak as yourself.";
const FALLBACK_COMPACT_SYSTEM: &str = "You are about to summarize a conversation for context compaction. Write the summary as yourself, in the first person; it is how you carry this conversation forward.";
const FALLBACK_INSTRUCTIONS: &str = "Summarize the conversation so far.";
const INTRO_PREAMBLE: &str = "This is your inner voice. Store these now:";
const FALLBACK_CHECK_IN: &str = "Please pause before continuing. You just came back from a context compaction.\n\nBefore you run any command, write any code, or take any action, briefly summarize what you think you should do next and wait for confirmation before proceeding.";

/// Opaque prompt texts of the identity.
#[derive(Debug, Clone)]
pub struct IdentityPrompts {
    /// Core prompt for `<eternal>`.
    pub soul: String,
    /// Compaction replacements.
    pub compact: CompactPrompts,
}

impl Default for IdentityPrompts {
    fn default() -> Self {
        Self {
            soul: FALLBACK_SOUL.to_string(),
            compact: CompactPrompts {
                system: FALLBACK_COMPACT_SYSTEM.to_string(),
                instructions: FALLBACK_INSTRUCTIONS.to_string(),
                check_in: FALLBACK_CHECK_IN.to_string(),
            },
        }
    }
}

impl IdentityPrompts {
    /// Load prompt files. Missing or unreadable files fall back to built-in text.
    pub fn load(settings: &IdentitySettings) -> Self {
        let defaults = Self::default();
        Self {
            soul: read_prompt(settings.soul_path.as_deref(), defaults.soul),
            compact: CompactPrompts {
                system: read_prompt(settings.compact_system_path.as_deref(), defaults.compact.system),
                instructions: read_prompt(
                    settings.compact_instructions_path.as_deref(),
                    defaults.compact.instructions,
                ),
                check_in: read_prompt(settings.check_in_path.as_deref(), defaults.compact.check_in),
            },
        }
    }
}

fn read_prompt(path: Option<&Path>, fallback: String) -> String {
    let Some(path) = path else {
        return fallback;
    };

    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => {
            info!(path = %path.display(), chars = text.len(), "Loaded prompt");
            text.trim().to_string()
        }
        Ok(_) => {
            warn!(path = %path.display(), "Prompt file is empty; using built-in text");
            fallback
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Prompt file unreadable; using built-in text");
            fallback
        }
    }
}

/// Composes the identity around each request.
pub struct IdentityPattern {
    soul: String,
    machine_name: Option<String>,
    rewriter: CompactRewriter,
    context: Arc<dyn ContextSource>,
    memories: Arc<dyn MemoryLookup>,
    memorables: Arc<dyn MemorablesSource>,
    memory_limit: usize,
    scrubber: Option<NoiseScrubber>,
}

impl IdentityPattern {
    /// Create the pattern.
    pub fn new(
        prompts: IdentityPrompts,
        context: Arc<dyn ContextSource>,
        memories: Arc<dyn MemoryLookup>,
    ) -> Self {
        Self {
            soul: prompts.soul,
            machine_name: None,
            rewriter: CompactRewriter::new(prompts.compact),
            context,
            memories,
            memorables: Arc::new(NoMemorables),
            memory_limit: 5,
            scrubber: None,
        }
    }

    /// Machine name used when the request reports none.
    #[must_use]
    pub fn with_machine_name(mut self, name: Option<String>) -> Self {
        self.machine_name = name;
        self
    }

    /// Maximum memories fetched per request.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Source of the session memorables injected as `<intro>`.
    #[must_use]
    pub fn with_memorables(mut self, memorables: Arc<dyn MemorablesSource>) -> Self {
        self.memorables = memorables;
        self
    }

    /// Scrub reminder noise before composing.
    #[must_use]
    pub fn with_scrubber(mut self, scrubber: Option<NoiseScrubber>) -> Self {
        self.scrubber = scrubber;
        self
    }

    fn machine_name<'a>(&'a self, metadata: &'a MetadataRecord, headers: &'a HeaderMap) -> &'a str {
        metadata
            .machine_fqdn()
            .or_else(|| header_str(headers, &HEADER_MACHINE_NAME))
            .or(self.machine_name.as_deref())
            .unwrap_or("unknown")
    }

    async fn context_sections(&self) -> ContextSections {
        match self.context.fetch().await {
            Ok(sections) => sections,
            Err(e) => {
                warn!(error = %e, "Context unavailable; composing without it");
                ContextSections::default()
            }
        }
    }

    async fn memories_for(&self, metadata: &MetadataRecord) -> Vec<Memory> {
        if !metadata.memories.is_empty() {
            return metadata.memories.clone();
        }

        let Some(prompt) = metadata.prompt.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Vec::new();
        };

        let queries = [prompt.to_string()];
        match self.memories.search(&queries, self.memory_limit).await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(error = %e, "Memory lookup failed; continuing without memories");
                Vec::new()
            }
        }
    }

    async fn memorables_for(&self, metadata: &MetadataRecord) -> Vec<String> {
        let Some(session_id) = metadata.session_id.as_deref().filter(|s| !s.is_empty()) else {
            return Vec::new();
        };

        match self.memorables.memorables(session_id).await {
            Ok(memorables) => memorables,
            Err(e) => {
                warn!(session_id, error = %e, "Memorables unavailable; continuing without them");
                Vec::new()
            }
        }
    }

    /// The four system blocks.
    pub fn compose(&self, machine_name: &str, sections: &ContextSections) -> Vec<Value> {
        let mut blocks = vec![text_block(format!("<eternal>\n{}\n</eternal>", self.soul))];

        let past: Vec<&str> = sections
            .past
            .iter()
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if !past.is_empty() {
            blocks.push(text_block(format!("<past>\n\n{}\n\n</past>", past.join("\n---\n"))));
        }

        let mut present = format!("**Machine:** {machine_name}");
        if let Some(weather) = &sections.weather {
            present.push_str("\n\n");
            present.push_str(weather);
        }
        blocks.push(text_block(format!("<present>\n\n{present}\n\n</present>")));

        let future: Vec<&str> = [&sections.calendar, &sections.todos]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .collect();
        let future = if future.is_empty() {
            "No events".to_string()
        } else {
            future.join("\n\n")
        };
        blocks.push(text_block(format!("<future>\n\n{future}\n\n</future>")));

        blocks
    }
}

impl Pattern for IdentityPattern {
    fn id(&self) -> PatternId {
        PatternId::Identity
    }

    fn transform_request<'a>(
        &'a self,
        ctx: &'a RequestContext,
        envelope: &'a mut RequestEnvelope,
    ) -> BoxFuture<'a, LoomResult<()>> {
        Box::pin(async move {
            if !envelope.is_json() {
                return Ok(());
            }

            let compacting = envelope
                .body()
                .is_some_and(|body| self.rewriter.classify(body).contains(CompactPhase::Summarizer));

            let (sections, memories, memorables) = tokio::join!(
                self.context_sections(),
                self.memories_for(&ctx.metadata),
                self.memorables_for(&ctx.metadata)
            );
            // A summarizer call has nothing to store.
            let intro = if compacting { None } else { intro_block(&memorables) };
            let machine_name = self.machine_name(&ctx.metadata, envelope.headers()).to_string();
            let system = self.compose(&machine_name, &sections);

            envelope.modify(|body| {
                if let Some(scrubber) = &self.scrubber {
                    scrubber.scrub(body);
                }

                // Compaction keeps its own system prompt.
                if compacting {
                    debug!("Compaction request; leaving system layout to the rewriter");
                } else {
                    weave_system(body, system);
                }

                if !memories.is_empty() {
                    append_memories(body, &memories);
                }
                if let Some(intro) = &intro {
                    append_intro(body, intro);
                }

                self.rewriter.apply(body);
                true
            });

            debug!(
                request_id = %ctx.request_id,
                machine = %machine_name,
                memories = memories.len(),
                memorables = memorables.len(),
                "Composed identity"
            );
            Ok(())
        })
    }
}

fn text_block(text: String) -> Value {
    json!({"type": "text", "text": text})
}

/// Lay our blocks out against the client's system value.
///
/// A list of two or more keeps its first element (client boilerplate the
/// upstream requires), replaces the second, and gets the rest inserted
/// after it. Shorter lists are extended; anything else is replaced.
pub fn weave_system(body: &mut Value, ours: Vec<Value>) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    match obj.entry("system").or_insert(Value::Null) {
        Value::Array(existing) if existing.len() >= 2 => {
            let mut ours = ours.into_iter();
            if let Some(first) = ours.next() {
                existing[1] = first;
            }
            for (offset, block) in ours.enumerate() {
                existing.insert(2 + offset, block);
            }
        }
        Value::Array(existing) => existing.extend(ours),
        other => {
            if !(other.is_string() || other.is_null()) {
                warn!("Unexpected system format; replacing it");
            }
            *other = Value::Array(ours);
        }
    }
}

/// Append rendered memories to the newest user text.
///
/// String content is converted to a text block so the memories can be
/// appended. Returns whether a target was found.
pub fn append_memories(body: &mut Value, memories: &[Memory]) -> bool {
    let now = Local::now();
    let rendered: Vec<String> = memories.iter().map(|m| m.render(now)).collect();
    let addition = format!("\n\n<memories>\n{}\n</memories>", rendered.join("\n\n"));

    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };

    for message in messages.iter_mut().rev() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(content) = message.get_mut("content") else {
            continue;
        };

        if let Value::String(text) = content {
            let text = std::mem::take(text);
            *content = json!([{"type": "text", "text": text}]);
        }

        let target = content.as_array_mut().and_then(|blocks| {
            blocks
                .iter_mut()
                .rev()
                .find(|block| is_block(block, "text"))
                .and_then(|block| block.get_mut("text"))
        });

        if let Some(Value::String(text)) = target {
            text.push_str(&addition);
            info!(count = memories.len(), "Appended memories to user message");
            return true;
        }
    }

    debug!("No user text to carry memories");
    false
}

/// Render memorables as an `<intro>` block.
///
/// Entries are trimmed and stripped of stray backticks; `None` when nothing
/// is left.
pub fn intro_block(memorables: &[String]) -> Option<String> {
    let cleaned: Vec<&str> = memorables
        .iter()
        .map(|m| m.trim().trim_matches('`').trim())
        .filter(|m| !m.is_empty())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let mut block = format!("<intro>\n{INTRO_PREAMBLE}");
    for memorable in cleaned {
        block.push_str("\n- ");
        block.push_str(memorable);
    }
    block.push_str("\n</intro>");
    Some(block)
}

/// Add `intro` as a text block after the newest user message with text.
///
/// Messages carrying only tool results are passed over. Returns whether a
/// target was found.
pub fn append_intro(body: &mut Value, intro: &str) -> bool {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };

    for message in messages.iter_mut().rev() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(content) = message.get_mut("content") else {
            continue;
        };

        if let Value::String(text) = content {
            let text = std::mem::take(text);
            *content = json!([{"type": "text", "text": text}]);
        }

        let Some(blocks) = content.as_array_mut() else {
            continue;
        };
        if blocks.iter().any(|block| is_block(block, "text")) {
            blocks.push(text_block(intro.to_string()));
            info!("Injected memorables into user message");
            return true;
        }
        debug!("Skipping tool-result-only user message");
    }

    debug!("No user message to carry memorables");
    false
}
