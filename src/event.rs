//! Step event stream - append-only log with live subscription
//!
//! Every status transition of every step is recorded as a `StepEvent` with a
//! monotonic id and a millisecond timestamp relative to run start. Reporters
//! subscribe through a broadcast channel; the log itself stays queryable
//! after the run for export and assertions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::{ChangeSetPlan, StackEventRecord};

/// Status of a step in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Submitted,
    InProgress,
    AwaitingApproval,
    Complete,
    Skipped,
    Failed,
    Canceled,
}

impl StepStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Skipped | Self::Failed | Self::Canceled
        )
    }

    /// Whether dependents of a step in this status may run.
    ///
    /// Skipped counts as satisfied: a locked or unchanged stack still
    /// provides outputs to its consumers.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::InProgress => "IN_PROGRESS",
            Self::AwaitingApproval => "AWAIT_APPROVAL",
            Self::Complete => "COMPLETE",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Optional payload attached to a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    /// Change-set summary proposed for review
    ChangeSet(ChangeSetPlan),
    /// A provider event-log record (from tailing)
    StackEvent(StackEventRecord),
    /// Outputs published when a step completes
    Outputs(Value),
    /// Parameter diff (for the diff action)
    ParameterDiff { added: Value, changed: Value, removed: Value },
}

/// Single event in the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    /// Monotonic sequence id (total order across the run)
    pub id: u64,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    /// Step logical name (run-level events use "*")
    pub step_id: Arc<str>,
    pub from: StepStatus,
    pub to: StepStatus,
    /// Human-readable transition reason ("locked", "creating new stack", ...)
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<EventDetail>,
}

/// Trait for emitting step events during execution
///
/// Real runs use an `EventBus`; tests that don't assert on events use
/// `NoopEmitter`.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: StepEvent) -> u64;

    /// Current ms offset from run start (used to stamp events before emit)
    fn now_ms(&self) -> u64;
}

/// Thread-safe append-only event log with live broadcast.
#[derive(Clone)]
pub struct EventBus {
    events: Arc<RwLock<Vec<StepEvent>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
    live: tokio::sync::broadcast::Sender<StepEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (live, _) = tokio::sync::broadcast::channel(1024);
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
            live,
        }
    }

    /// Record a transition. The id and timestamp fields of `event` are
    /// overwritten; callers pass zero.
    pub fn transition(
        &self,
        step_id: Arc<str>,
        from: StepStatus,
        to: StepStatus,
        reason: Option<String>,
        detail: Option<EventDetail>,
    ) -> u64 {
        self.emit(StepEvent {
            id: 0,
            timestamp_ms: 0,
            step_id,
            from,
            to,
            reason,
            detail,
        })
    }

    /// Subscribe to live events. Slow subscribers may miss events
    /// (broadcast semantics); the log keeps everything.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StepEvent> {
        self.live.subscribe()
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<StepEvent> {
        self.events.read().clone()
    }

    /// Events for one step, in emission order.
    pub fn for_step(&self, step_id: &str) -> Vec<StepEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| &*e.step_id == step_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Export the log as a JSON array.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&*self.events.read()).unwrap_or(Value::Null)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, mut event: StepEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        event.timestamp_ms = self.start_time.elapsed().as_millis() as u64;
        // Send before appending so subscribers and the log agree on ids;
        // a lagging receiver is a reporter problem, not ours.
        let _ = self.live.send(event.clone());
        self.events.write().push(event);
        id
    }

    fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// No-op emitter for tests (zero allocation, always returns 0)
#[derive(Debug, Clone, Default)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: StepEvent) -> u64 {
        0
    }

    fn now_ms(&self) -> u64 {
        0
    }
}
