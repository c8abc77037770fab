//! Pluggable execution substrates
//!
//! A backend receives fully resolved work units and reports outcomes over
//! a channel; it never sees bindings, splits, or the dependency graph.
//! `dispatch` must not block the scheduler: implementations spawn their
//! work and return immediately.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::record::UnitId;
use crate::task::{TaskBody, TaskInputs, TaskOutputs, TaskSpec};

/// One fully resolved execution handed to a backend
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub unit: UnitId,
    pub spec: Arc<TaskSpec>,
    pub inputs: TaskInputs,
    /// Content-addressed identity (task name + resolved inputs)
    pub identity: u64,
}

/// Why a unit failed
#[derive(Debug, Clone)]
pub enum UnitFailure {
    /// The task body itself returned an error
    Task(String),
    /// The execution substrate failed before or around the body
    Dispatch(String),
}

/// Result of one dispatched unit, reported back to the scheduler
#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: UnitId,
    pub identity: u64,
    pub result: Result<TaskOutputs, UnitFailure>,
    pub duration: std::time::Duration,
}

/// Execution substrate: runs resolved units and reports outcomes.
///
/// The contract is fire-and-forget: `dispatch` spawns whatever it needs
/// and returns; outcomes arrive on the channel in completion order, which
/// the scheduler never relies on.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(
        &self,
        batch: Vec<WorkUnit>,
        out: mpsc::Sender<UnitOutcome>,
        cancel: CancellationToken,
    );
}

/// Run one unit's body to completion
async fn run_unit(spec: Arc<TaskSpec>, inputs: TaskInputs) -> Result<TaskOutputs, UnitFailure> {
    let outputs = match spec.body() {
        TaskBody::Func(f) => {
            // Function bodies may compute for a while; keep them off the
            // async worker threads
            let f = Arc::clone(f);
            let task_inputs = inputs.clone();
            tokio::task::spawn_blocking(move || f(&task_inputs))
                .await
                .map_err(|e| UnitFailure::Dispatch(format!("worker crashed: {}", e)))?
                .map_err(UnitFailure::Task)?
        }
        TaskBody::Command(template) => template.run(&inputs).await.map_err(UnitFailure::Task)?,
        TaskBody::Subflow(_) => {
            return Err(UnitFailure::Dispatch(
                "nested workflows run in the scheduler, not on a backend".to_string(),
            ))
        }
    };
    check_declared_outputs(&spec, outputs)
}

/// A Done record must carry every declared output slot. A body that
/// returns a different shape fails its own unit; consumers then inherit
/// that failure instead of dereferencing a missing slot.
fn check_declared_outputs(
    spec: &TaskSpec,
    outputs: TaskOutputs,
) -> Result<TaskOutputs, UnitFailure> {
    for slot in spec.output_schema() {
        if !outputs.contains_key(slot.name.as_ref()) {
            return Err(UnitFailure::Task(format!(
                "body returned no value for declared output '{}'",
                slot.name
            )));
        }
    }
    Ok(outputs)
}

async fn run_and_report(unit: WorkUnit, out: mpsc::Sender<UnitOutcome>) {
    let started = Instant::now();
    let result = run_unit(Arc::clone(&unit.spec), unit.inputs).await;
    let outcome = UnitOutcome {
        unit: unit.unit,
        identity: unit.identity,
        result,
        duration: started.elapsed(),
    };
    if out.send(outcome).await.is_err() {
        // Session already torn down
        warn!(task = %unit.spec.name(), "outcome channel closed");
    }
}

// ─────────────────────────────────────────────────────────────────────
// Sequential backend
// ─────────────────────────────────────────────────────────────────────

/// Runs units one at a time, in batch order. Deterministic scheduling for
/// debugging and tests.
#[derive(Debug, Default)]
pub struct SequentialBackend;

#[async_trait]
impl ExecutorBackend for SequentialBackend {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn dispatch(
        &self,
        batch: Vec<WorkUnit>,
        out: mpsc::Sender<UnitOutcome>,
        cancel: CancellationToken,
    ) {
        debug!(units = batch.len(), "dispatching sequentially");
        tokio::spawn(async move {
            for unit in batch {
                if cancel.is_cancelled() {
                    break;
                }
                run_and_report(unit, out.clone()).await;
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────
// Concurrent pool backend
// ─────────────────────────────────────────────────────────────────────

/// Runs units concurrently up to a fixed limit
#[derive(Debug)]
pub struct PoolBackend {
    permits: Arc<Semaphore>,
}

impl PoolBackend {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl ExecutorBackend for PoolBackend {
    fn name(&self) -> &'static str {
        "concurrent-pool"
    }

    async fn dispatch(
        &self,
        batch: Vec<WorkUnit>,
        out: mpsc::Sender<UnitOutcome>,
        cancel: CancellationToken,
    ) {
        debug!(units = batch.len(), "dispatching to pool");
        for unit in batch {
            let permits = Arc::clone(&self.permits);
            let out = out.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }
                run_and_report(unit, out).await;
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Subprocess backend
// ─────────────────────────────────────────────────────────────────────

/// Runs command units as child processes; rejects in-process bodies so a
/// misconfigured workflow fails loudly instead of silently running
/// functions without isolation
#[derive(Debug, Default)]
pub struct SubprocessBackend;

#[async_trait]
impl ExecutorBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn dispatch(
        &self,
        batch: Vec<WorkUnit>,
        out: mpsc::Sender<UnitOutcome>,
        cancel: CancellationToken,
    ) {
        debug!(units = batch.len(), "dispatching subprocesses");
        for unit in batch {
            let out = out.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if cancel.is_cancelled() {
                    return;
                }
                if !matches!(unit.spec.body(), TaskBody::Command(_)) {
                    let outcome = UnitOutcome {
                        unit: unit.unit.clone(),
                        identity: unit.identity,
                        result: Err(UnitFailure::Dispatch(format!(
                            "task '{}' has no command body; the subprocess backend only runs commands",
                            unit.spec.name()
                        ))),
                        duration: std::time::Duration::ZERO,
                    };
                    let _ = out.send(outcome).await;
                    return;
                }
                run_and_report(unit, out).await;
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Backend selection
// ─────────────────────────────────────────────────────────────────────

/// Which execution substrate a submitter uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Sequential,
    ConcurrentPool,
    Subprocess,
}

impl BackendKind {
    pub fn build(&self, concurrency: usize) -> Box<dyn ExecutorBackend> {
        match self {
            BackendKind::Sequential => Box::new(SequentialBackend),
            BackendKind::ConcurrentPool => Box::new(PoolBackend::new(concurrency)),
            BackendKind::Subprocess => Box::new(SubprocessBackend),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::error::SpindleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(BackendKind::Sequential),
            "concurrent-pool" => Ok(BackendKind::ConcurrentPool),
            "subprocess" => Ok(BackendKind::Subprocess),
            other => Err(crate::error::SpindleError::UnknownBackend {
                key: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Sequential => "sequential",
            BackendKind::ConcurrentPool => "concurrent-pool",
            BackendKind::Subprocess => "subprocess",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::NodeId;
    use crate::task::{task_fn, ValueKind};
    use serde_json::json;
    use std::str::FromStr;

    fn double_unit(x: i64) -> WorkUnit {
        let spec = task_fn(
            "double",
            &[("x", ValueKind::Int)],
            ("out", ValueKind::Int),
            |inputs| Ok(json!(inputs["x"].as_i64().unwrap_or(0) * 2)),
        );
        let mut inputs = TaskInputs::new();
        inputs.insert("x".to_string(), json!(x));
        WorkUnit {
            unit: UnitId::split(NodeId(0), vec![x as usize]),
            identity: x as u64,
            spec,
            inputs,
        }
    }

    #[tokio::test]
    async fn sequential_backend_reports_all_outcomes() {
        let (tx, mut rx) = mpsc::channel(8);
        let backend = SequentialBackend;
        let batch = vec![double_unit(1), double_unit(2), double_unit(3)];
        backend.dispatch(batch, tx, CancellationToken::new()).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let outcome = rx.recv().await.unwrap();
            seen.push(outcome.result.unwrap()["out"].clone());
        }
        // Sequential order matches batch order
        assert_eq!(seen, vec![json!(2), json!(4), json!(6)]);
    }

    #[tokio::test]
    async fn pool_backend_runs_all_units() {
        let (tx, mut rx) = mpsc::channel(8);
        let backend = PoolBackend::new(2);
        let batch = vec![double_unit(1), double_unit(2), double_unit(3)];
        backend.dispatch(batch, tx, CancellationToken::new()).await;

        let mut outputs: Vec<i64> = Vec::new();
        for _ in 0..3 {
            let outcome = rx.recv().await.unwrap();
            outputs.push(outcome.result.unwrap()["out"].as_i64().unwrap());
        }
        outputs.sort();
        assert_eq!(outputs, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn failing_body_is_a_task_failure() {
        let spec = task_fn(
            "bad",
            &[],
            ("out", ValueKind::Any),
            |_| Err::<serde_json::Value, _>("boom".to_string()),
        );
        let unit = WorkUnit {
            unit: UnitId::whole(NodeId(0)),
            identity: 0,
            spec,
            inputs: TaskInputs::new(),
        };

        let (tx, mut rx) = mpsc::channel(1);
        SequentialBackend
            .dispatch(vec![unit], tx, CancellationToken::new())
            .await;
        let outcome = rx.recv().await.unwrap();
        match outcome.result {
            Err(UnitFailure::Task(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn undeclared_output_shape_fails_the_unit() {
        let spec = TaskSpec::builder("liar")
            .output("out", ValueKind::Int)
            .func(|_| {
                let mut outputs = TaskOutputs::new();
                outputs.insert("wrong".to_string(), json!(1));
                Ok(outputs)
            });
        let unit = WorkUnit {
            unit: UnitId::whole(NodeId(0)),
            identity: 0,
            spec,
            inputs: TaskInputs::new(),
        };

        let (tx, mut rx) = mpsc::channel(1);
        SequentialBackend
            .dispatch(vec![unit], tx, CancellationToken::new())
            .await;
        let outcome = rx.recv().await.unwrap();
        match outcome.result {
            Err(UnitFailure::Task(msg)) => assert!(msg.contains("'out'")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn subprocess_backend_rejects_function_bodies() {
        let (tx, mut rx) = mpsc::channel(1);
        SubprocessBackend
            .dispatch(vec![double_unit(1)], tx, CancellationToken::new())
            .await;
        let outcome = rx.recv().await.unwrap();
        match outcome.result {
            Err(UnitFailure::Dispatch(msg)) => assert!(msg.contains("command")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_dispatch_stops_sequential_batch() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        SequentialBackend
            .dispatch(vec![double_unit(1)], tx, cancel)
            .await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!(
            BackendKind::from_str("sequential").unwrap(),
            BackendKind::Sequential
        );
        assert_eq!(
            BackendKind::from_str("concurrent-pool").unwrap(),
            BackendKind::ConcurrentPool
        );
        assert!(BackendKind::from_str("gpu").is_err());
        assert_eq!(BackendKind::Subprocess.to_string(), "subprocess");
    }
}
