//! Transcript tailing.
//!
//! The client appends one JSON object per line to a transcript file per
//! session. When the metadata names that file, a tail task follows it and
//! hands each new line to the [`EventSink`]. One task per session; it stops
//! once the file has been quiet for the idle timeout.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collab::EventSink;

/// A line appended to a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    /// Session the transcript belongs to.
    pub session_id: String,
    /// Entry type (`user`, `assistant`, `summary`, ...).
    pub kind: Option<String>,
    /// Message role, when the entry is a message.
    pub role: Option<String>,
    /// Types of the message's content blocks.
    pub content_types: Vec<String>,
    /// The entry as written.
    pub raw: Value,
}

impl TranscriptLine {
    /// Parse one JSONL line. Blank and non-JSON lines yield `None`.
    pub fn parse(session_id: &str, line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let raw: Value = serde_json::from_str(line).ok()?;

        let message = raw.get("message");
        let content_types = match message.and_then(|m| m.get("content")) {
            Some(Value::String(_)) => vec!["text".to_string()],
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("type").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            session_id: session_id.to_string(),
            kind: raw.get("type").and_then(Value::as_str).map(str::to_string),
            role: message
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
                .map(str::to_string),
            content_types,
            raw,
        })
    }
}

/// A running tail task.
#[derive(Debug)]
struct Follower {
    id: u64,
    /// Set once the task has decided to stop.
    stopping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Follower {
    fn is_live(&self) -> bool {
        !self.stopping.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

/// Follows transcript files, one task per session.
pub struct TranscriptWatcher {
    sink: Arc<dyn EventSink>,
    idle_timeout: Duration,
    poll_interval: Duration,
    next_id: AtomicU64,
    sessions: Arc<DashMap<String, Follower>>,
}

impl std::fmt::Debug for TranscriptWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptWatcher")
            .field("sessions", &self.sessions.len())
            .field("idle_timeout", &self.idle_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl TranscriptWatcher {
    /// Create a watcher.
    pub fn new(sink: Arc<dyn EventSink>, idle_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            sink,
            idle_timeout,
            poll_interval,
            next_id: AtomicU64::new(0),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Follow `path` for `session_id` unless it is already followed.
    ///
    /// Only lines appended after this call are published. A task that is
    /// stopping or gone is replaced. Returns whether a new task was started.
    pub fn watch(&self, session_id: &str, path: impl Into<PathBuf>) -> bool {
        let entry = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => return false,
            entry => entry,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stopping = Arc::new(AtomicBool::new(false));
        let tail = Tail {
            session_id: session_id.to_string(),
            path: path.into(),
            sink: Arc::clone(&self.sink),
            idle_timeout: self.idle_timeout,
            poll_interval: self.poll_interval,
            stopping: Arc::clone(&stopping),
        };
        let sessions = Arc::clone(&self.sessions);
        let handle = tokio::spawn(async move {
            let session_id = tail.session_id.clone();
            tail.run().await;
            // A newer task may already own the entry.
            sessions.remove_if(&session_id, |_, follower| follower.id == id);
        });
        let follower = Follower {
            id,
            stopping,
            handle,
        };

        match entry {
            Entry::Occupied(mut entry) => {
                debug!(session_id, "Replacing stopped transcript follower");
                entry.insert(follower).handle.abort();
            }
            Entry::Vacant(entry) => {
                entry.insert(follower);
            }
        }
        true
    }

    /// Number of sessions being followed.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Stop every tail task.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().handle.abort();
        }
        self.sessions.clear();
    }
}

impl Drop for TranscriptWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Tail {
    session_id: String,
    path: PathBuf,
    sink: Arc<dyn EventSink>,
    idle_timeout: Duration,
    poll_interval: Duration,
    stopping: Arc<AtomicBool>,
}

impl Tail {
    async fn run(self) {
        let mut offset = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut partial = Vec::new();
        let mut last_activity = Instant::now();

        info!(session_id = %self.session_id, path = %self.path.display(), "Following transcript");

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;

            match self.read_from(offset).await {
                Ok(Some((bytes, len))) => {
                    if len < offset {
                        debug!(session_id = %self.session_id, "Transcript truncated; restarting");
                        partial.clear();
                    }
                    offset = len;
                    if !bytes.is_empty() {
                        last_activity = Instant::now();
                        partial.extend_from_slice(&bytes);
                        self.publish_lines(&mut partial);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Failed to read transcript");
                }
            }

            if last_activity.elapsed() >= self.idle_timeout {
                self.stopping.store(true, Ordering::Release);
                info!(session_id = %self.session_id, "Transcript idle; stopping");
                break;
            }
        }
    }

    /// Bytes appended since `offset` and the file's current length.
    async fn read_from(&self, offset: u64) -> std::io::Result<Option<(Vec<u8>, u64)>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = meta.len();
        if len == offset {
            return Ok(None);
        }

        let start = if len < offset { 0 } else { offset };
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut bytes = Vec::new();
        file.take(len - start).read_to_end(&mut bytes).await?;
        let end = start + bytes.len() as u64;
        Ok(Some((bytes, end)))
    }

    fn publish_lines(&self, partial: &mut Vec<u8>) {
        let Some(last_newline) = partial.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete: Vec<u8> = partial.drain(..=last_newline).collect();

        for line in String::from_utf8_lossy(&complete).lines() {
            match TranscriptLine::parse(&self.session_id, line) {
                Some(line) => self.sink.publish_transcript(&line),
                None if !line.trim().is_empty() => {
                    debug!(session_id = %self.session_id, "Skipping unparsable transcript line");
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;
    use crate::collab::MemorySink;

    #[test]
    fn test_parse_message_line() {
        let line = json!({
            "type": "assistant",
            "sessionId": "s1",
            "message": {"role": "assistant", "content": [
                {"type": "text", "text": "hi"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}}
            ]}
        })
        .to_string();

        let parsed = TranscriptLine::parse("s1", &line).unwrap();
        assert_eq!(parsed.kind.as_deref(), Some("assistant"));
        assert_eq!(parsed.role.as_deref(), Some("assistant"));
        assert_eq!(parsed.content_types, vec!["text", "tool_use"]);

        let user = TranscriptLine::parse("s1", r#"{"type":"user","message":{"role":"user","content":"hello"}}"#).unwrap();
        assert_eq!(user.content_types, vec!["text"]);

        let summary = TranscriptLine::parse("s1", r#"{"type":"summary","summary":"x"}"#).unwrap();
        assert!(summary.role.is_none());
        assert!(summary.content_types.is_empty());

        assert!(TranscriptLine::parse("s1", "   ").is_none());
        assert!(TranscriptLine::parse("s1", "{not json").is_none());
    }

    #[tokio::test]
    async fn test_tails_appended_lines() {
        let dir = std::env::temp_dir().join(format!("loom-watch-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.jsonl");
        std::fs::write(&path, "{\"type\":\"user\",\"old\":true}\n").unwrap();

        let sink = Arc::new(MemorySink::default());
        let watcher = TranscriptWatcher::new(
            sink.clone(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        );
        assert!(watcher.watch("s1", &path));
        assert!(!watcher.watch("s1", &path));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"assistant\",\"message\":{\"role\":\"assistant\",\"content\":[]}}\n{\"type\":\"us").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        file.write_all(b"er\"}\n").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = sink.lines.lock().clone();
        let kinds: Vec<_> = lines.iter().map(|l| l.kind.clone().unwrap_or_default()).collect();
        assert_eq!(kinds, vec!["assistant", "user"]);
        assert!(lines.iter().all(|l| l.session_id == "s1"));

        watcher.shutdown();
        assert_eq!(watcher.active(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_stops_when_idle() {
        let sink = Arc::new(MemorySink::default());
        let watcher = TranscriptWatcher::new(
            sink,
            Duration::from_millis(30),
            Duration::from_millis(10),
        );

        assert!(watcher.watch("s1", "/nonexistent/transcript.jsonl"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(watcher.active(), 0);

        // The session can be followed again once its task is gone.
        assert!(watcher.watch("s1", "/nonexistent/transcript.jsonl"));
        assert_eq!(watcher.active(), 1);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_stopping_follower_is_replaced() {
        let sink = Arc::new(MemorySink::default());
        let watcher = TranscriptWatcher::new(
            sink,
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        assert!(watcher.watch("s1", "/nonexistent/transcript.jsonl"));
        let first = watcher.sessions.get("s1").map(|f| f.id).unwrap();

        // Mark the running task as on its way out.
        watcher
            .sessions
            .get("s1")
            .unwrap()
            .stopping
            .store(true, Ordering::Release);

        assert!(watcher.watch("s1", "/nonexistent/transcript.jsonl"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The old task's exit leaves the new follower in place.
        assert_eq!(watcher.active(), 1);
        let second = watcher.sessions.get("s1").map(|f| f.id).unwrap();
        assert_ne!(first, second);
        assert!(watcher.sessions.get("s1").unwrap().is_live());
        watcher.shutdown();
    }
}
