//! Session result store and cross-session memoization cache
//!
//! Both are sharded concurrent maps shared by `Arc`: backend workers write
//! outcomes while the scheduler reads dependency outputs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::binding::NodeId;
use crate::record::ExecState;
use crate::split::MultiIndex;
use crate::task::TaskOutputs;

/// Why a node ended Errored: preserves the failure origin as it fans out
/// to downstream nodes
#[derive(Debug, Clone)]
pub struct Failure {
    /// Task where the failure originated (not the task inheriting it)
    pub task: Arc<str>,
    /// Split index of the failing unit, if the origin was split
    pub index: Option<MultiIndex>,
    pub error: String,
    /// True when the execution substrate failed rather than the task body
    pub dispatch: bool,
}

/// Final result of one task node
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub state: ExecState,
    /// Combined outputs for split tasks, plain outputs otherwise.
    /// Empty unless `state` is `Done`.
    pub outputs: TaskOutputs,
    pub failure: Option<Failure>,
    pub duration: Duration,
}

impl NodeResult {
    pub fn done(outputs: TaskOutputs, duration: Duration) -> Self {
        Self {
            state: ExecState::Done,
            outputs,
            failure: None,
            duration,
        }
    }

    pub fn errored(failure: Failure, duration: Duration) -> Self {
        Self {
            state: ExecState::Errored,
            outputs: TaskOutputs::new(),
            failure: Some(failure),
            duration,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: ExecState::Cancelled,
            outputs: TaskOutputs::new(),
            failure: None,
            duration: Duration::ZERO,
        }
    }
}

/// Per-session store of node results, keyed by node
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Arc<DashMap<NodeId, NodeResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: NodeId, result: NodeResult) {
        self.results.insert(node, result);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.results.contains_key(&node)
    }

    pub fn get(&self, node: NodeId) -> Option<NodeResult> {
        self.results.get(&node).map(|r| r.clone())
    }

    pub fn is_success(&self, node: NodeId) -> bool {
        self.results
            .get(&node)
            .map(|r| r.state == ExecState::Done)
            .unwrap_or(false)
    }

    /// Read one output slot of a completed node
    pub fn get_output(&self, node: NodeId, slot: &str) -> Option<Value> {
        self.results
            .get(&node)
            .and_then(|r| r.outputs.get(slot).cloned())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Memoization cache keyed by execution identity (task name + resolved
/// inputs). Shared across submissions through the same submitter, so a
/// repeated identity replays its outputs without dispatch.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<DashMap<u64, TaskOutputs>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: u64) -> Option<TaskOutputs> {
        self.entries.get(&identity).map(|e| e.clone())
    }

    pub fn insert(&self, identity: u64, outputs: TaskOutputs) {
        self.entries.insert(identity, outputs);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
