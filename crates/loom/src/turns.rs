//! Grouping of upstream calls into turns.
//!
//! A turn is every call sharing one trace id, from the user's prompt to the
//! first answer that asks for no tool. Slots live in a [`DashMap`] so
//! read-modify-write on one trace locks only its shard. Finished turns
//! leave a tombstone for a grace period to absorb stragglers.
//!
//! Span ends, metrics and sink hand-off happen after the slot is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::Context;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::canary::MetadataRecord;
use crate::collab::EventSink;
use crate::config::TurnSettings;
use crate::error::{LoomError, LoomResult};
use crate::sse::StreamSummary;
use crate::trace_context::{end_span, SpanOutcome, TraceContextManager};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// A call answered without asking for a tool.
    Completed,
    /// A call failed.
    Errored,
    /// Nothing happened for the idle timeout.
    TimedOut,
}

impl TurnOutcome {
    /// Label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::TimedOut => "timed_out",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::TimedOut => 1,
            Self::Errored => 2,
        }
    }
}

/// A turn handed to the event sink.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedTurn {
    /// Trace the turn belongs to.
    pub trace_id: String,
    /// Client session, if known.
    pub session_id: Option<String>,
    /// Upstream calls in the turn.
    pub call_count: u32,
    /// Assistant text across all calls.
    pub text: String,
    /// Input tokens summed over calls.
    pub input_tokens: u64,
    /// Output tokens summed over calls.
    pub output_tokens: u64,
    /// How it ended.
    pub outcome: TurnOutcome,
    /// First failure, if any.
    pub error: Option<String>,
    /// When the first call began.
    pub started_at: DateTime<Utc>,
    /// Time from first call to finalize.
    pub duration_ms: u64,
}

/// Identifies one call within a turn.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    trace_id: String,
    call: u32,
    span: Context,
}

impl TurnHandle {
    /// Trace the call belongs to.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 1-based position of the call within the turn.
    pub fn call(&self) -> u32 {
        self.call
    }

    /// The turn span, used as the parent of the call span.
    pub fn span(&self) -> &Context {
        &self.span
    }
}

/// Observable state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Calls are still expected.
    Open {
        /// Calls so far.
        call_count: u32,
        /// Calls not yet completed.
        in_flight: u32,
    },
    /// Finalized; kept for the grace period.
    Closed(TurnOutcome),
}

#[derive(Debug)]
struct TurnRecord {
    session_id: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    last_activity: Instant,
    text: String,
    call_count: u32,
    in_flight: u32,
    input_tokens: u64,
    output_tokens: u64,
    /// Outcome decided while other calls were still streaming.
    outcome: Option<TurnOutcome>,
    error: Option<String>,
    span: Context,
}

impl TurnRecord {
    fn decide(&mut self, outcome: TurnOutcome) {
        if self.outcome.map_or(true, |current| outcome.rank() > current.rank()) {
            self.outcome = Some(outcome);
        }
    }

    fn ready(&self) -> bool {
        self.in_flight == 0 && self.outcome.is_some()
    }
}

#[derive(Debug)]
enum TurnSlot {
    Open(TurnRecord),
    Closed {
        closed_at: Instant,
        outcome: TurnOutcome,
    },
}

/// Tracks open turns by trace id.
pub struct TurnTracker {
    turns: DashMap<String, TurnSlot>,
    settings: TurnSettings,
    traces: Arc<TraceContextManager>,
    sink: Arc<dyn EventSink>,
    running: AtomicBool,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
    sweep_handle: RwLock<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TurnTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTracker")
            .field("slots", &self.turns.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TurnTracker {
    /// Create a tracker.
    pub fn new(
        settings: TurnSettings,
        traces: Arc<TraceContextManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            turns: DashMap::new(),
            settings,
            traces,
            sink,
            running: AtomicBool::new(false),
            shutdown_tx: RwLock::new(None),
            sweep_handle: RwLock::new(None),
        }
    }

    /// Register a call for `trace_id`, opening the turn if needed.
    pub fn begin_call(&self, trace_id: &str, metadata: &MetadataRecord) -> TurnHandle {
        let now = Instant::now();

        let handle = match self.turns.entry(trace_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                TurnSlot::Open(record) => {
                    record.call_count += 1;
                    record.in_flight += 1;
                    record.last_activity = now;
                    TurnHandle {
                        trace_id: trace_id.to_string(),
                        call: record.call_count,
                        span: record.span.clone(),
                    }
                }
                TurnSlot::Closed { closed_at, outcome } => {
                    if now.duration_since(*closed_at) < self.settings.grace_period {
                        info!(
                            trace_id,
                            previous = outcome.as_str(),
                            "Call arrived after its turn closed; opening a new turn"
                        );
                    }
                    let record = self.open_record(metadata, now);
                    let handle = TurnHandle {
                        trace_id: trace_id.to_string(),
                        call: 1,
                        span: record.span.clone(),
                    };
                    entry.insert(TurnSlot::Open(record));
                    handle
                }
            },
            Entry::Vacant(entry) => {
                let record = self.open_record(metadata, now);
                let handle = TurnHandle {
                    trace_id: trace_id.to_string(),
                    call: 1,
                    span: record.span.clone(),
                };
                entry.insert(TurnSlot::Open(record));
                handle
            }
        };

        if handle.call == 1 {
            debug!(trace_id, "Turn opened");
            loom_telemetry::metrics::set_open_turns(self.open_turns());
        } else {
            debug!(trace_id, call = handle.call, "Turn continued");
        }
        handle
    }

    fn open_record(&self, metadata: &MetadataRecord, now: Instant) -> TurnRecord {
        TurnRecord {
            session_id: metadata.session_id.clone(),
            started_at: Utc::now(),
            started: now,
            last_activity: now,
            text: String::new(),
            call_count: 1,
            in_flight: 1,
            input_tokens: 0,
            output_tokens: 0,
            outcome: None,
            error: None,
            span: self.traces.start_turn(metadata),
        }
    }

    /// Record a finished call. An answer with no tool use ends the turn
    /// once every other call in it has finished too.
    pub fn complete_call(&self, handle: &TurnHandle, summary: &StreamSummary) {
        let finalized = self.update(handle, |record| {
            if !summary.text.is_empty() {
                if !record.text.is_empty() {
                    record.text.push_str("\n\n");
                }
                record.text.push_str(&summary.text);
            }
            record.input_tokens += summary.input_tokens;
            record.output_tokens += summary.output_tokens;

            if let Some(error) = &summary.error {
                record.error.get_or_insert_with(|| error.clone());
                record.decide(TurnOutcome::Errored);
            } else if !summary.has_tool_use() {
                record.decide(TurnOutcome::Completed);
            }
        });

        if let Some(turn) = finalized {
            self.publish(turn);
        }
    }

    /// Record a failed call; the turn ends as errored.
    pub fn fail_call(&self, handle: &TurnHandle, reason: &str) {
        let finalized = self.update(handle, |record| {
            record.error.get_or_insert_with(|| reason.to_string());
            record.decide(TurnOutcome::Errored);
        });

        if let Some(turn) = finalized {
            self.publish(turn);
        }
    }

    /// Apply `f` to the open record and close it if it became ready.
    fn update(
        &self,
        handle: &TurnHandle,
        f: impl FnOnce(&mut TurnRecord),
    ) -> Option<(FinalizedTurn, Context)> {
        let Entry::Occupied(mut entry) = self.turns.entry(handle.trace_id.clone()) else {
            debug!(trace_id = %handle.trace_id, "Call finished for an evicted turn");
            return None;
        };

        let TurnSlot::Open(record) = entry.get_mut() else {
            debug!(trace_id = %handle.trace_id, "Call finished after its turn closed");
            return None;
        };

        record.in_flight = record.in_flight.saturating_sub(1);
        record.last_activity = Instant::now();
        f(record);

        if !record.ready() {
            return None;
        }

        let outcome = record.outcome.unwrap_or(TurnOutcome::Completed);
        let slot = entry.insert(TurnSlot::Closed {
            closed_at: Instant::now(),
            outcome,
        });
        match slot {
            TurnSlot::Open(record) => Some(finalize(&handle.trace_id, record, outcome)),
            TurnSlot::Closed { .. } => None,
        }
    }

    /// Force-finalize idle turns and drop expired tombstones.
    ///
    /// Returns the number of turns finalized.
    pub fn sweep(&self, now: Instant) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let grace_period = self.settings.grace_period;
        let mut expired = Vec::new();

        self.turns.retain(|trace_id, slot| {
            let idle = match slot {
                // A call still streaming keeps the turn open; its completion
                // guard always reports back.
                TurnSlot::Open(record) => {
                    record.in_flight == 0
                        && now.saturating_duration_since(record.last_activity) >= idle_timeout
                }
                TurnSlot::Closed { closed_at, .. } => {
                    return now.saturating_duration_since(*closed_at) < grace_period;
                }
            };

            if idle {
                let outcome = TurnOutcome::TimedOut;
                let closed = std::mem::replace(
                    slot,
                    TurnSlot::Closed {
                        closed_at: now,
                        outcome,
                    },
                );
                if let TurnSlot::Open(mut record) = closed {
                    record.decide(outcome);
                    expired.push(finalize(trace_id, record, outcome));
                }
            }
            true
        });

        let count = expired.len();
        for turn in expired {
            self.publish(turn);
        }
        if count > 0 {
            loom_telemetry::metrics::set_open_turns(self.open_turns());
        }
        count
    }

    fn publish(&self, (turn, span): (FinalizedTurn, Context)) {
        let span_outcome = match turn.outcome {
            TurnOutcome::Completed => SpanOutcome::Ok,
            TurnOutcome::Errored => {
                SpanOutcome::Error(turn.error.clone().unwrap_or_else(|| "call failed".to_string()))
            }
            TurnOutcome::TimedOut => SpanOutcome::Error("turn idle timeout".to_string()),
        };
        end_span(&span, &span_outcome);

        match turn.outcome {
            TurnOutcome::Completed => info!(
                trace_id = %turn.trace_id,
                call_count = turn.call_count,
                duration_ms = turn.duration_ms,
                "Turn completed"
            ),
            TurnOutcome::Errored => warn!(
                trace_id = %turn.trace_id,
                call_count = turn.call_count,
                error = turn.error.as_deref().unwrap_or(""),
                "Turn ended with an error"
            ),
            TurnOutcome::TimedOut => warn!(
                trace_id = %turn.trace_id,
                call_count = turn.call_count,
                idle_timeout = ?self.settings.idle_timeout,
                "Turn force-finalized after idle timeout"
            ),
        }

        loom_telemetry::metrics::record_turn_finalized(turn.outcome.as_str(), turn.call_count);
        loom_telemetry::metrics::set_open_turns(self.open_turns());
        self.sink.publish_turn(&turn);
    }

    /// Number of open turns.
    pub fn open_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|slot| matches!(slot.value(), TurnSlot::Open(_)))
            .count()
    }

    /// State of the slot for `trace_id`.
    pub fn snapshot(&self, trace_id: &str) -> Option<TurnState> {
        self.turns.get(trace_id).map(|slot| match slot.value() {
            TurnSlot::Open(record) => TurnState::Open {
                call_count: record.call_count,
                in_flight: record.in_flight,
            },
            TurnSlot::Closed { outcome, .. } => TurnState::Closed(*outcome),
        })
    }

    /// Whether the sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the background sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> LoomResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(LoomError::internal("turn sweeper already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write() = Some(shutdown_tx);

        let tracker: Weak<Self> = Arc::downgrade(self);
        let sweep_interval = self.settings.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(tracker) = tracker.upgrade() else {
                            break;
                        };
                        let finalized = tracker.sweep(Instant::now());
                        if finalized > 0 {
                            debug!(finalized, "Turn sweep finished");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Turn sweeper received shutdown signal");
                        break;
                    }
                }
            }
        });

        *self.sweep_handle.write() = Some(handle);
        info!(interval = ?sweep_interval, "Turn sweeper started");
        Ok(())
    }

    /// Stop the background sweeper and wait for it.
    pub async fn stop_sweeper(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let tx = self.shutdown_tx.write().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self.sweep_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("Turn sweeper stopped");
    }
}

impl Drop for TurnTracker {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            if let Some(tx) = self.shutdown_tx.write().take() {
                let _ = tx.try_send(());
            }
        }
    }
}

fn finalize(trace_id: &str, record: TurnRecord, outcome: TurnOutcome) -> (FinalizedTurn, Context) {
    let duration_ms = u64::try_from(record.started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let turn = FinalizedTurn {
        trace_id: trace_id.to_string(),
        session_id: record.session_id,
        call_count: record.call_count,
        text: record.text,
        input_tokens: record.input_tokens,
        output_tokens: record.output_tokens,
        outcome,
        error: record.error,
        started_at: record.started_at,
        duration_ms,
    };
    (turn, record.span)
}

/// Default settings suitable for tests.
#[cfg(test)]
pub(crate) fn test_settings() -> TurnSettings {
    TurnSettings {
        idle_timeout: std::time::Duration::from_secs(60),
        grace_period: std::time::Duration::from_secs(5),
        sweep_interval: std::time::Duration::from_millis(20),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collab::MemorySink;

    fn tracker() -> (Arc<TurnTracker>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let tracker = Arc::new(TurnTracker::new(
            test_settings(),
            Arc::new(TraceContextManager::new()),
            sink.clone(),
        ));
        (tracker, sink)
    }

    fn metadata() -> MetadataRecord {
        MetadataRecord {
            session_id: Some("s1".to_string()),
            ..Default::default()
        }
    }

    fn answer(text: &str, tool: bool) -> StreamSummary {
        StreamSummary {
            text: text.to_string(),
            input_tokens: 10,
            output_tokens: 2,
            tool_uses: if tool { vec!["Bash".to_string()] } else { Vec::new() },
            completed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_tool_loop_folds_into_one_turn() {
        let (tracker, sink) = tracker();

        for i in 0..3 {
            let handle = tracker.begin_call("t1", &metadata());
            assert_eq!(handle.call(), i + 1);
            tracker.complete_call(&handle, &answer(&format!("step {i}"), true));
            assert!(sink.turns.lock().is_empty());
        }
        let handle = tracker.begin_call("t1", &metadata());
        tracker.complete_call(&handle, &answer("done", false));

        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].call_count, 4);
        assert_eq!(turns[0].outcome, TurnOutcome::Completed);
        assert_eq!(turns[0].text, "step 0\n\nstep 1\n\nstep 2\n\ndone");
        assert_eq!(turns[0].input_tokens, 40);
        assert_eq!(turns[0].session_id.as_deref(), Some("s1"));
        assert_eq!(
            tracker.snapshot("t1"),
            Some(TurnState::Closed(TurnOutcome::Completed))
        );
        assert_eq!(tracker.open_turns(), 0);
    }

    #[test]
    fn test_final_answer_waits_for_in_flight_call() {
        let (tracker, sink) = tracker();

        let first = tracker.begin_call("t1", &metadata());
        let second = tracker.begin_call("t1", &metadata());

        // The follow-up finishes before the tool-use call it followed.
        tracker.complete_call(&second, &answer("final", false));
        assert!(sink.turns.lock().is_empty());
        assert_eq!(
            tracker.snapshot("t1"),
            Some(TurnState::Open {
                call_count: 2,
                in_flight: 1
            })
        );

        tracker.complete_call(&first, &answer("using tool", true));
        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].call_count, 2);
        assert_eq!(turns[0].outcome, TurnOutcome::Completed);
    }

    #[test]
    fn test_failure_finalizes_as_errored() {
        let (tracker, sink) = tracker();

        let handle = tracker.begin_call("t1", &metadata());
        tracker.fail_call(&handle, "connection reset");

        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].outcome, TurnOutcome::Errored);
        assert_eq!(turns[0].error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_in_band_error_wins_over_completion() {
        let (tracker, sink) = tracker();

        let handle = tracker.begin_call("t1", &metadata());
        let mut summary = answer("partial", false);
        summary.error = Some("Overloaded".to_string());
        tracker.complete_call(&handle, &summary);

        assert_eq!(sink.turns.lock()[0].outcome, TurnOutcome::Errored);
    }

    #[test]
    fn test_idle_turn_is_swept() {
        let (tracker, sink) = tracker();

        let handle = tracker.begin_call("t1", &metadata());
        tracker.complete_call(&handle, &answer("tool", true));
        assert_eq!(tracker.sweep(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(tracker.sweep(later), 1);
        assert_eq!(sink.turns.lock()[0].outcome, TurnOutcome::TimedOut);
        assert_eq!(
            tracker.snapshot("t1"),
            Some(TurnState::Closed(TurnOutcome::TimedOut))
        );

        // Tombstone outlives the grace period only until the next sweep.
        assert_eq!(tracker.sweep(later + Duration::from_secs(6)), 0);
        assert!(tracker.snapshot("t1").is_none());
    }

    #[test]
    fn test_sweep_waits_for_in_flight_call() {
        let (tracker, sink) = tracker();

        let first = tracker.begin_call("t1", &metadata());
        let second = tracker.begin_call("t1", &metadata());
        tracker.complete_call(&first, &answer("final", false));

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(tracker.sweep(later), 0);
        assert!(sink.turns.lock().is_empty());
        assert_eq!(
            tracker.snapshot("t1"),
            Some(TurnState::Open {
                call_count: 2,
                in_flight: 1
            })
        );

        tracker.complete_call(&second, &answer("tool", true));
        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].outcome, TurnOutcome::Completed);
        assert_eq!(turns[0].call_count, 2);
    }

    #[test]
    fn test_late_completion_after_sweep_is_ignored() {
        let (tracker, sink) = tracker();

        let first = tracker.begin_call("t1", &metadata());
        tracker.complete_call(&first, &answer("tool", true));
        tracker.sweep(Instant::now() + Duration::from_secs(61));
        assert_eq!(sink.turns.lock().len(), 1);

        // A completion for the swept turn must not publish a second record.
        tracker.complete_call(&first, &answer("late", false));
        assert_eq!(sink.turns.lock().len(), 1);
    }

    #[test]
    fn test_call_after_close_opens_new_turn() {
        let (tracker, sink) = tracker();

        let handle = tracker.begin_call("t1", &metadata());
        tracker.complete_call(&handle, &answer("one", false));

        let handle = tracker.begin_call("t1", &metadata());
        assert_eq!(handle.call(), 1);
        tracker.complete_call(&handle, &answer("two", false));

        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.call_count == 1));
    }

    #[test]
    fn test_concurrent_calls_lose_no_updates() {
        let (tracker, sink) = tracker();
        let first = tracker.begin_call("t1", &metadata());

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let handle = tracker.begin_call("t1", &metadata());
                    tracker.complete_call(&handle, &answer("x", true));
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        tracker.complete_call(&first, &answer("final", false));
        let turns = sink.turns.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].call_count, 17);
        assert_eq!(turns[0].output_tokens, 34);
    }

    #[test]
    fn test_turns_are_independent() {
        let (tracker, sink) = tracker();

        let a = tracker.begin_call("a", &metadata());
        let b = tracker.begin_call("b", &metadata());
        assert_eq!(tracker.open_turns(), 2);

        tracker.complete_call(&a, &answer("a", false));
        assert_eq!(tracker.open_turns(), 1);
        tracker.complete_call(&b, &answer("b", false));
        assert_eq!(sink.turns.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let (tracker, _sink) = tracker();

        tracker.spawn_sweeper().unwrap();
        assert!(tracker.is_sweeping());
        assert!(tracker.spawn_sweeper().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.stop_sweeper().await;
        assert!(!tracker.is_sweeping());
    }
}
