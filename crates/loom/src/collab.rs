//! External collaborators.
//!
//! The proxy hands finished turns and transcript lines to an [`EventSink`],
//! asks a [`MemoryLookup`] for memories, reads prompt context from a
//! [`ContextSource`] and per-session memorables from a [`MemorablesSource`].
//! Each has a Redis or HTTP implementation and a local one for tests and
//! standalone use.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::canary::Memory;
use crate::error::{LoomError, LoomResult};
use crate::pattern::BoxFuture;
use crate::turns::FinalizedTurn;
use crate::watcher::TranscriptLine;

/// Redis channel finalized turns are published on.
pub const TURN_CHANNEL: &str = "loom:turns";

/// Redis channel transcript lines are published on.
pub const TRANSCRIPT_CHANNEL: &str = "loom:transcripts";

/// Redis keys holding prompt context.
const WEATHER_KEY: &str = "hud:weather";
const CALENDAR_KEY: &str = "hud:calendar";
const TODOS_KEY: &str = "hud:todos";
const PAST_TODAY_KEY: &str = "systemprompt:past:today";

/// Redis list of memorables noticed in a session.
fn memorables_key(session_id: &str) -> String {
    format!("intro:memorables:{session_id}")
}

/// Receives finished work. Publishing never blocks the caller.
pub trait EventSink: Send + Sync {
    /// Hand off a finalized turn.
    fn publish_turn(&self, turn: &FinalizedTurn);

    /// Hand off a transcript line.
    fn publish_transcript(&self, line: &TranscriptLine);
}

/// Looks up memories relevant to a prompt.
pub trait MemoryLookup: Send + Sync {
    /// Search with `queries`, returning at most `limit` memories.
    fn search<'a>(&'a self, queries: &'a [String], limit: usize) -> BoxFuture<'a, LoomResult<Vec<Memory>>>;
}

/// Supplies the context woven into system prompts.
pub trait ContextSource: Send + Sync {
    /// Fetch the current sections.
    fn fetch(&self) -> BoxFuture<'_, LoomResult<ContextSections>>;
}

/// Supplies the memorables noticed so far in a session.
pub trait MemorablesSource: Send + Sync {
    /// Memorables for `session_id`, oldest first.
    fn memorables<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, LoomResult<Vec<String>>>;
}

/// Context sections for one request. Every field is opaque text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSections {
    /// Summaries of earlier periods, oldest first.
    pub past: Vec<String>,
    /// Current weather.
    pub weather: Option<String>,
    /// Upcoming events.
    pub calendar: Option<String>,
    /// Open todos.
    pub todos: Option<String>,
}

/// Logs events instead of publishing them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish_turn(&self, turn: &FinalizedTurn) {
        info!(
            trace_id = %turn.trace_id,
            session_id = turn.session_id.as_deref().unwrap_or(""),
            call_count = turn.call_count,
            outcome = turn.outcome.as_str(),
            input_tokens = turn.input_tokens,
            output_tokens = turn.output_tokens,
            text_len = turn.text.len(),
            duration_ms = turn.duration_ms,
            "Turn finalized"
        );
    }

    fn publish_transcript(&self, line: &TranscriptLine) {
        debug!(
            session_id = %line.session_id,
            kind = line.kind.as_deref().unwrap_or(""),
            role = line.role.as_deref().unwrap_or(""),
            "Transcript line"
        );
    }
}

/// Publishes events as JSON on Redis channels.
#[derive(Clone)]
pub struct RedisSink {
    conn: ConnectionManager,
}

impl RedisSink {
    /// Connect to Redis.
    pub async fn connect(url: &str) -> LoomResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;

        info!(url = %url, "Connected event sink to Redis");
        Ok(Self { conn })
    }

    fn spawn_publish(&self, channel: &'static str, payload: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(channel, "No runtime available; dropping event");
            return;
        };

        let mut conn = self.conn.clone();
        handle.spawn(async move {
            let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
            if let Err(e) = result {
                warn!(channel, error = %e, "Failed to publish event");
            }
        });
    }
}

impl EventSink for RedisSink {
    fn publish_turn(&self, turn: &FinalizedTurn) {
        match serde_json::to_string(turn) {
            Ok(payload) => self.spawn_publish(TURN_CHANNEL, payload),
            Err(e) => warn!(error = %e, "Failed to serialize turn"),
        }
    }

    fn publish_transcript(&self, line: &TranscriptLine) {
        match serde_json::to_string(line) {
            Ok(payload) => self.spawn_publish(TRANSCRIPT_CHANNEL, payload),
            Err(e) => warn!(error = %e, "Failed to serialize transcript line"),
        }
    }
}

/// Returns no memories.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemories;

impl MemoryLookup for NoMemories {
    fn search<'a>(&'a self, _queries: &'a [String], _limit: usize) -> BoxFuture<'a, LoomResult<Vec<Memory>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    queries: &'a [String],
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    memories: Vec<Value>,
}

/// Searches memories over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMemoryLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpMemoryLookup {
    /// Create a lookup posting to `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> LoomResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoomError::collaborator("memory", e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl MemoryLookup for HttpMemoryLookup {
    fn search<'a>(&'a self, queries: &'a [String], limit: usize) -> BoxFuture<'a, LoomResult<Vec<Memory>>> {
        Box::pin(async move {
            if queries.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }

            let response = self
                .client
                .post(&self.url)
                .json(&SearchRequest { queries, limit })
                .send()
                .await
                .map_err(|e| LoomError::collaborator("memory", e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(LoomError::collaborator(
                    "memory",
                    format!("search returned {status}"),
                ));
            }

            let body: SearchResponse = response
                .json()
                .await
                .map_err(|e| LoomError::collaborator("memory", e.to_string()))?;

            Ok(body
                .memories
                .into_iter()
                .filter_map(memory_from_value)
                .take(limit)
                .collect())
        })
    }
}

/// Memories arrive as bare strings or as objects.
fn memory_from_value(value: Value) -> Option<Memory> {
    match value {
        Value::String(text) => Some(Memory::from_text(text)),
        Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

/// Fixed context sections.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    sections: ContextSections,
}

impl StaticContext {
    /// Serve `sections` on every fetch.
    pub fn new(sections: ContextSections) -> Self {
        Self { sections }
    }
}

impl ContextSource for StaticContext {
    fn fetch(&self) -> BoxFuture<'_, LoomResult<ContextSections>> {
        Box::pin(async move { Ok(self.sections.clone()) })
    }
}

/// Reads context sections from Redis keys.
#[derive(Clone)]
pub struct RedisContextSource {
    conn: ConnectionManager,
}

impl RedisContextSource {
    /// Connect to Redis.
    pub async fn connect(url: &str) -> LoomResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;
        Ok(Self { conn })
    }
}

impl ContextSource for RedisContextSource {
    fn fetch(&self) -> BoxFuture<'_, LoomResult<ContextSections>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let keys = [WEATHER_KEY, CALENDAR_KEY, TODOS_KEY, PAST_TODAY_KEY];
            let values: Vec<Option<String>> = conn
                .mget(&keys[..])
                .await
                .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;

            let mut values = values.into_iter().map(|v| v.filter(|s| !s.trim().is_empty()));
            let weather = values.next().flatten();
            let calendar = values.next().flatten();
            let todos = values.next().flatten();
            let past = values.next().flatten().into_iter().collect();

            Ok(ContextSections {
                past,
                weather,
                calendar,
                todos,
            })
        })
    }
}

/// Returns no memorables.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemorables;

impl MemorablesSource for NoMemorables {
    fn memorables<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, LoomResult<Vec<String>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Reads memorables from per-session Redis lists.
#[derive(Clone)]
pub struct RedisMemorablesSource {
    conn: ConnectionManager,
}

impl RedisMemorablesSource {
    /// Connect to Redis.
    pub async fn connect(url: &str) -> LoomResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;
        Ok(Self { conn })
    }
}

impl MemorablesSource for RedisMemorablesSource {
    fn memorables<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, LoomResult<Vec<String>>> {
        Box::pin(async move {
            if session_id.is_empty() {
                return Ok(Vec::new());
            }

            let mut conn = self.conn.clone();
            let memorables: Vec<String> = conn
                .lrange(memorables_key(session_id), 0, -1)
                .await
                .map_err(|e| LoomError::collaborator("redis", e.to_string()))?;

            if !memorables.is_empty() {
                debug!(session_id, count = memorables.len(), "Found memorables");
            }
            Ok(memorables)
        })
    }
}

/// Keeps published events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub(crate) turns: parking_lot::Mutex<Vec<FinalizedTurn>>,
    pub(crate) lines: parking_lot::Mutex<Vec<TranscriptLine>>,
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn publish_turn(&self, turn: &FinalizedTurn) {
        self.turns.lock().push(turn.clone());
    }

    fn publish_transcript(&self, line: &TranscriptLine) {
        self.lines.lock().push(line.clone());
    }
}
