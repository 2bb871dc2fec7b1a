//! Compaction rewriting.
//!
//! When the client compacts a long conversation it swaps in a generic
//! summarizer system prompt, appends generic summary instructions to the
//! last user message, and on the following request tells the model to carry
//! on without asking. Each of the three is recognized by a fixed phrase and
//! replaced with the identity's own text. Classification is per request;
//! nothing is remembered between requests.

use std::fmt;

use serde_json::Value;
use tracing::info;

use crate::envelope::{visit_texts, visit_texts_mut, Role, TextSite};

/// Phrase opening the client's summarizer system prompt.
pub const SUMMARIZER_MARKER: &str =
    "You are a helpful AI assistant tasked with summarizing conversations";

/// Phrase opening the client's summary instructions.
pub const INSTRUCTIONS_MARKER: &str =
    "Your task is to create a detailed summary of the conversation so far";

/// First sentence of the client's post-compaction continuation.
pub const CONTINUATION_LEAD: &str = "Please continue the conversation from where we left it off without asking the user any further questions";

/// Remainder of the continuation after its first sentence.
pub const CONTINUATION_TAIL: &str = ". Continue with the last task that you were asked to work on.";

/// One of the three compaction rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactPhase {
    /// Summarizer system prompt replaced.
    Summarizer,
    /// Summary instructions replaced.
    Instructions,
    /// Continuation replaced with a check-in.
    Continuation,
}

impl CompactPhase {
    /// All phases in order.
    pub const ALL: [Self; 3] = [Self::Summarizer, Self::Instructions, Self::Continuation];

    /// Metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Summarizer => "summarizer",
            Self::Instructions => "instructions",
            Self::Continuation => "continuation",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::Summarizer => 0b001,
            Self::Instructions => 0b010,
            Self::Continuation => 0b100,
        }
    }
}

impl fmt::Display for CompactPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactPhases(u8);

impl CompactPhases {
    /// The empty set.
    pub const NONE: Self = Self(0);

    /// Every phase.
    pub const ALL: Self = Self(0b111);

    /// Set containing one phase.
    pub const fn only(phase: CompactPhase) -> Self {
        Self(phase.bit())
    }

    /// Add a phase.
    pub fn insert(&mut self, phase: CompactPhase) {
        self.0 |= phase.bit();
    }

    /// Whether the set holds `phase`.
    pub const fn contains(self, phase: CompactPhase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Phases in the set, in order.
    pub fn iter(self) -> impl Iterator<Item = CompactPhase> {
        CompactPhase::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl std::ops::BitOr for CompactPhases {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CompactPhases {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Replacement texts supplied by the identity.
#[derive(Debug, Clone, Default)]
pub struct CompactPrompts {
    /// System prompt used while summarizing.
    pub system: String,
    /// Summary instructions.
    pub instructions: String,
    /// Check-in that replaces the continuation.
    pub check_in: String,
}

/// Detects and rewrites the three compaction phases.
#[derive(Debug, Clone)]
pub struct CompactRewriter {
    prompts: CompactPrompts,
    enabled: CompactPhases,
}

impl CompactRewriter {
    /// Rewriter for all three phases.
    pub fn new(prompts: CompactPrompts) -> Self {
        Self::with_phases(prompts, CompactPhases::ALL)
    }

    /// Rewriter limited to `enabled`.
    pub fn with_phases(prompts: CompactPrompts, enabled: CompactPhases) -> Self {
        Self { prompts, enabled }
    }

    /// Prompts in use.
    pub fn prompts(&self) -> &CompactPrompts {
        &self.prompts
    }

    /// Rewrite one text.
    ///
    /// Returns the new text and the phases applied, or `None` when no
    /// enabled phase matches.
    pub fn rewrite(&self, site: TextSite, text: &str) -> Option<(String, CompactPhases)> {
        if site.nested {
            return None;
        }

        if site.role == Role::System
            && self.enabled.contains(CompactPhase::Summarizer)
            && text.contains(SUMMARIZER_MARKER)
        {
            return Some((
                self.prompts.system.clone(),
                CompactPhases::only(CompactPhase::Summarizer),
            ));
        }

        let mut current: Option<String> = None;
        let mut applied = CompactPhases::NONE;

        let instructions_site = site.role == Role::System || (site.role == Role::User && site.last_user);
        if instructions_site && self.enabled.contains(CompactPhase::Instructions) {
            if let Some(idx) = text.find(INSTRUCTIONS_MARKER) {
                let kept = text[..idx].trim_end();
                let rewritten = if kept.is_empty() {
                    self.prompts.instructions.clone()
                } else {
                    format!("{kept}\n\n{}", self.prompts.instructions)
                };
                current = Some(rewritten);
                applied.insert(CompactPhase::Instructions);
            }
        }

        if site.role == Role::User && self.enabled.contains(CompactPhase::Continuation) {
            let source = current.as_deref().unwrap_or(text);
            if let Some(rewritten) = self.rewrite_continuation(source) {
                current = Some(rewritten);
                applied.insert(CompactPhase::Continuation);
            }
        }

        current.map(|text| (text, applied))
    }

    fn rewrite_continuation(&self, text: &str) -> Option<String> {
        let check_in = self.prompts.check_in.as_str();

        if !check_in.is_empty() {
            let polluted = format!("{check_in}{CONTINUATION_TAIL}");
            if text.contains(&polluted) {
                return Some(text.replace(&polluted, check_in));
            }
        }

        let full = format!("{CONTINUATION_LEAD}{CONTINUATION_TAIL}");
        text.contains(&full).then(|| text.replace(&full, check_in))
    }

    /// Phases a body would trigger, without changing it.
    pub fn classify(&self, body: &Value) -> CompactPhases {
        let mut phases = CompactPhases::NONE;
        visit_texts(body, |site, text| {
            if let Some((_, applied)) = self.rewrite(site, text) {
                phases |= applied;
            }
        });
        phases
    }

    /// Rewrite a body in place and return the phases applied.
    pub fn apply(&self, body: &mut Value) -> CompactPhases {
        let mut phases = CompactPhases::NONE;
        visit_texts_mut(body, |site, text| {
            if let Some((rewritten, applied)) = self.rewrite(site, text) {
                *text = rewritten;
                for phase in applied.iter() {
                    loom_telemetry::metrics::record_compact_rewrite(phase.as_str());
                }
                phases |= applied;
            }
        });

        if !phases.is_empty() {
            let applied: Vec<&str> = phases.iter().map(CompactPhase::as_str).collect();
            info!(phases = ?applied, "Rewrote compaction request");
        }

        phases
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SUMMARIZER: &str = "You are a helpful AI assistant tasked with summarizing conversations. Be thorough.";

    fn prompts() -> CompactPrompts {
        CompactPrompts {
            system: "You're Alpha. Summarize as yourself.".to_string(),
            instructions: "Write the summary in first person.".to_string(),
            check_in: "Pause and check in before acting.".to_string(),
        }
    }

    fn continuation() -> String {
        format!("{CONTINUATION_LEAD}{CONTINUATION_TAIL}")
    }

    #[test]
    fn test_phase_one_string_system() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({"system": SUMMARIZER, "messages": []});

        let phases = rewriter.apply(&mut body);
        assert_eq!(phases, CompactPhases::only(CompactPhase::Summarizer));
        assert_eq!(body["system"], "You're Alpha. Summarize as yourself.");
    }

    #[test]
    fn test_phase_one_keeps_preamble_block() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({"system": [
            {"type": "text", "text": "You are a Claude agent."},
            {"type": "text", "text": SUMMARIZER, "cache_control": {"type": "ephemeral"}}
        ]});

        rewriter.apply(&mut body);
        assert_eq!(body["system"][0]["text"], "You are a Claude agent.");
        assert_eq!(body["system"][1]["text"], "You're Alpha. Summarize as yourself.");
        assert_eq!(body["system"][1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_phase_two_keeps_prefix() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({"messages": [
            {"role": "user", "content": format!("earlier\n\n{INSTRUCTIONS_MARKER}, paying attention to...")},
            {"role": "assistant", "content": "ok"},
            {"role": "user", "content": [
                {"type": "text", "text": "last words   "},
                {"type": "text", "text": format!("notes \n{INSTRUCTIONS_MARKER}. Include code.")}
            ]}
        ]});

        let phases = rewriter.apply(&mut body);
        assert_eq!(phases, CompactPhases::only(CompactPhase::Instructions));
        assert_eq!(body["messages"][2]["content"][0]["text"], "last words   ");
        assert_eq!(
            body["messages"][2]["content"][1]["text"],
            "notes\n\nWrite the summary in first person."
        );
        // Only the newest user message is rewritten.
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains(INSTRUCTIONS_MARKER));
    }

    #[test]
    fn test_phase_two_without_prefix() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({"messages": [{"role": "user", "content": INSTRUCTIONS_MARKER}]});

        rewriter.apply(&mut body);
        assert_eq!(body["messages"][0]["content"], "Write the summary in first person.");
    }

    #[test]
    fn test_phase_three_replaces_continuation() {
        let rewriter = CompactRewriter::new(prompts());
        let text = format!("This session is being continued.\n\n{}", continuation());
        let mut body = json!({"messages": [{"role": "user", "content": [{"type": "text", "text": text}]}]});

        let phases = rewriter.apply(&mut body);
        assert_eq!(phases, CompactPhases::only(CompactPhase::Continuation));
        assert_eq!(
            body["messages"][0]["content"][0]["text"],
            "This session is being continued.\n\nPause and check in before acting."
        );
    }

    #[test]
    fn test_phase_three_repairs_half_rewrite() {
        let rewriter = CompactRewriter::new(prompts());
        let text = format!("Summary.\n\nPause and check in before acting.{CONTINUATION_TAIL}");
        let mut body = json!({"messages": [{"role": "user", "content": text}]});

        rewriter.apply(&mut body);
        assert_eq!(
            body["messages"][0]["content"],
            "Summary.\n\nPause and check in before acting."
        );
    }

    #[test]
    fn test_phases_combined() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({
            "system": SUMMARIZER,
            "messages": [{"role": "user", "content": format!("hi\n{INSTRUCTIONS_MARKER}")}]
        });

        assert_eq!(
            rewriter.classify(&body),
            CompactPhases::only(CompactPhase::Summarizer) | CompactPhases::only(CompactPhase::Instructions)
        );
        let phases = rewriter.apply(&mut body);
        assert!(phases.contains(CompactPhase::Summarizer));
        assert!(phases.contains(CompactPhase::Instructions));
        assert!(!phases.contains(CompactPhase::Continuation));
        assert_eq!(body["messages"][0]["content"], "hi\n\nWrite the summary in first person.");
    }

    #[test]
    fn test_no_markers_is_noop() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({
            "system": "You are Claude.",
            "messages": [
                {"role": "user", "content": "Please continue the conversation."},
                {"role": "assistant", "content": SUMMARIZER}
            ]
        });
        let before = body.clone();

        assert!(rewriter.classify(&body).is_empty());
        assert!(rewriter.apply(&mut body).is_empty());
        assert_eq!(body, before);
    }

    #[test]
    fn test_disabled_phases_are_skipped() {
        let rewriter =
            CompactRewriter::with_phases(prompts(), CompactPhases::only(CompactPhase::Continuation));
        let mut body = json!({
            "system": SUMMARIZER,
            "messages": [{"role": "user", "content": continuation()}]
        });

        let phases = rewriter.apply(&mut body);
        assert_eq!(phases, CompactPhases::only(CompactPhase::Continuation));
        assert_eq!(body["system"], SUMMARIZER);
    }

    #[test]
    fn test_tool_results_are_not_rewritten() {
        let rewriter = CompactRewriter::new(prompts());
        let mut body = json!({"messages": [{"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "t", "content": continuation()}
        ]}]});
        let before = body.clone();

        assert!(rewriter.apply(&mut body).is_empty());
        assert_eq!(body, before);
    }

    #[test]
    fn test_phase_set() {
        let mut phases = CompactPhases::NONE;
        assert!(phases.is_empty());
        phases.insert(CompactPhase::Continuation);
        phases.insert(CompactPhase::Summarizer);
        assert_eq!(
            phases.iter().collect::<Vec<_>>(),
            vec![CompactPhase::Summarizer, CompactPhase::Continuation]
        );
        assert_eq!(CompactPhase::Instructions.to_string(), "instructions");
    }
}
