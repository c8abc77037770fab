//! Append-only execution trace
//!
//! Every session writes a structured trace of what happened and when.
//! - Event: envelope with id + timestamp + kind
//! - EventKind: session-level, task-level, and cache/combine variants
//! - EventLog: thread-safe, append-only log shared by clone

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the session trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since session start (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All trace event types.
///
/// Task-level `task_id` fields use the unit label: the task name, suffixed
/// with the split index for split units ("filter[0, 2]").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // SESSION LEVEL
    // ═══════════════════════════════════════════
    SessionStarted {
        task_count: usize,
    },
    SessionCompleted {
        total_duration_ms: u64,
    },
    SessionFailed {
        error: String,
        failed_task: Option<Arc<str>>,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskScheduled {
        task_id: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    /// One split task expanded into its sub-instances
    SplitExpanded {
        task_id: Arc<str>,
        unit_count: usize,
    },
    /// A unit was handed to the backend with its resolved inputs
    TaskStarted {
        task_id: Arc<str>,
        inputs: Value,
    },
    TaskCompleted {
        task_id: Arc<str>,
        output: Value,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        duration_ms: u64,
    },
    TaskCancelled {
        task_id: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // CACHE / COMBINE
    // ═══════════════════════════════════════════
    /// A unit's outputs were replayed from the memoization cache
    CacheHit {
        task_id: Arc<str>,
        identity: u64,
    },
    /// A split task's unit outputs were reassembled in index order
    OutputsCombined {
        task_id: Arc<str>,
        unit_count: usize,
    },
}

impl EventKind {
    /// Extract task_id if event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::SplitExpanded { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::CacheHit { task_id, .. }
            | Self::OutputsCombined { task_id, .. } => Some(task_id),
            Self::SessionStarted { .. }
            | Self::SessionCompleted { .. }
            | Self::SessionFailed { .. } => None,
        }
    }

    /// Check if this is a session-level event
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            Self::SessionStarted { .. }
                | Self::SessionCompleted { .. }
                | Self::SessionFailed { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at session start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by task ID (unit label for split units)
    pub fn filter_task(&self, task_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.task_id() == Some(task_id))
            .collect()
    }

    /// Filter session-level events only
    pub fn session_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_session_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
