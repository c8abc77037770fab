//! Execution identities and lifecycle states

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::backend::UnitFailure;
use crate::binding::NodeId;
use crate::split::MultiIndex;
use crate::task::{TaskInputs, TaskOutputs};

/// Lifecycle of one task node within a session.
///
/// Terminal states are `Done`, `Errored`, and `Cancelled`; the scheduler
/// never moves a node out of a terminal state. `Ready` is transient: a
/// node enters it the moment its dependencies finish and moves to
/// `Running` within the same scheduling sweep, once its units are
/// expanded and dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Pending,
    Ready,
    Running,
    Done,
    Errored,
    Cancelled,
}

impl ExecState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecState::Done | ExecState::Errored | ExecState::Cancelled
        )
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecState::Pending => "pending",
            ExecState::Ready => "ready",
            ExecState::Running => "running",
            ExecState::Done => "done",
            ExecState::Errored => "errored",
            ExecState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Address of one dispatched execution: a node plus its split index
/// (empty for unsplit tasks)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub node: NodeId,
    pub index: MultiIndex,
}

impl UnitId {
    pub fn whole(node: NodeId) -> Self {
        Self {
            node,
            index: Vec::new(),
        }
    }

    pub fn split(node: NodeId, index: MultiIndex) -> Self {
        Self { node, index }
    }
}

/// Bookkeeping for one finished unit: its split index, content-addressed
/// identity, and outcome. The scheduler accumulates these per node until
/// the node can be finalized.
#[derive(Debug)]
pub struct ExecutionRecord {
    pub index: MultiIndex,
    pub identity: u64,
    pub result: Result<TaskOutputs, UnitFailure>,
    pub duration: Duration,
}

/// Format a split index the way it appears in logs and errors: "[0, 2]"
pub fn format_index(index: &MultiIndex) -> String {
    let parts: Vec<String> = index.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Display label for a unit: "name" or "name[0, 2]"
pub fn unit_label(task: &Arc<str>, index: &MultiIndex) -> String {
    if index.is_empty() {
        task.to_string()
    } else {
        format!("{}{}", task, format_index(index))
    }
}

/// Content-addressed identity of one execution: the task name plus the
/// full resolved input map.
///
/// `TaskInputs` is a `BTreeMap`, so serialization order is fixed and two
/// executions with equal inputs always hash the same.
pub fn identity_hash(task: &str, inputs: &TaskInputs) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(task.as_bytes());
    hasher.update(b"\0");
    // BTreeMap keys serialize sorted; infallible for Value trees
    let encoded = serde_json::to_vec(inputs).unwrap_or_default();
    hasher.update(&encoded);
    hasher.digest()
}
