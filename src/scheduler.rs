//! Dependency-driven session scheduler
//!
//! A session walks the workflow by readiness, not by a precomputed
//! schedule: a task becomes eligible the moment every task it references
//! is Done. Failures propagate along reference edges; independent
//! subgraphs keep running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::backend::{ExecutorBackend, UnitFailure, UnitOutcome, WorkUnit};
use crate::binding::{Binding, NodeId};
use crate::error::SpindleError;
use crate::event::{EventKind, EventLog};
use crate::graph::DepGraph;
use crate::record::{identity_hash, unit_label, ExecState, ExecutionRecord, UnitId};
use crate::split::{combine_permutation, expand, MultiIndex, SubInstance};
use crate::store::{Failure, NodeResult, ResultCache, ResultStore};
use crate::task::{TaskBody, TaskInputs, TaskOutputs, TaskSpec};
use crate::workflow::{TaskInstance, Workflow};

/// What a finished session hands back to the submitter
#[derive(Debug)]
pub(crate) struct SessionOutcome {
    pub states: Vec<ExecState>,
    pub store: ResultStore,
    /// Declared workflow outputs whose producers finished Done
    pub outputs: BTreeMap<String, Value>,
    /// Origin of the first failure, if any task errored
    pub first_failure: Option<Failure>,
}

struct PendingNode {
    expected: usize,
    results: Vec<ExecutionRecord>,
    dims: Vec<usize>,
    perm: Vec<usize>,
    split: bool,
    started: Instant,
}

struct Session<'a> {
    workflow: &'a Workflow,
    graph: DepGraph,
    backend: &'a dyn ExecutorBackend,
    cache: ResultCache,
    cache_enabled: bool,
    events: EventLog,
    cancel: CancellationToken,
    inputs: TaskInputs,
    store: ResultStore,
    states: Vec<ExecState>,
    pending: HashMap<NodeId, PendingNode>,
    /// Identity of every unit currently on the backend
    inflight: HashMap<u64, UnitId>,
    /// Units waiting on an identical in-flight execution
    followers: HashMap<u64, Vec<UnitId>>,
    outstanding: usize,
    first_failure: Option<Failure>,
    tx: mpsc::Sender<UnitOutcome>,
}

/// Run one workflow to completion. Boxed so nested workflows can recurse
/// through it.
pub(crate) fn run_session<'a>(
    workflow: &'a Workflow,
    inputs: TaskInputs,
    backend: &'a dyn ExecutorBackend,
    cache: ResultCache,
    cache_enabled: bool,
    events: EventLog,
    cancel: CancellationToken,
) -> BoxFuture<'a, Result<SessionOutcome, SpindleError>> {
    drive(workflow, inputs, backend, cache, cache_enabled, events, cancel).boxed()
}

#[instrument(skip_all, fields(workflow = %workflow.name()))]
async fn drive(
    workflow: &Workflow,
    provided: TaskInputs,
    backend: &dyn ExecutorBackend,
    cache: ResultCache,
    cache_enabled: bool,
    events: EventLog,
    cancel: CancellationToken,
) -> Result<SessionOutcome, SpindleError> {
    workflow.validate()?;
    let inputs = merge_workflow_inputs(workflow, provided)?;

    let (tx, mut rx) = mpsc::channel::<UnitOutcome>(64);
    let started = Instant::now();
    events.emit(EventKind::SessionStarted {
        task_count: workflow.task_count(),
    });

    let mut session = Session {
        workflow,
        graph: DepGraph::from_workflow(workflow),
        backend,
        cache,
        cache_enabled,
        events: events.clone(),
        cancel: cancel.clone(),
        inputs,
        store: ResultStore::new(),
        states: vec![ExecState::Pending; workflow.task_count()],
        pending: HashMap::new(),
        inflight: HashMap::new(),
        followers: HashMap::new(),
        outstanding: 0,
        first_failure: None,
        tx,
    };

    session.sweep().await?;

    loop {
        if session.states.iter().all(|s| s.is_terminal()) {
            break;
        }
        if session.outstanding == 0 {
            let waiting = session
                .states
                .iter()
                .filter(|s| !s.is_terminal())
                .count();
            return Err(SpindleError::Stalled {
                details: format!("{} tasks waiting with nothing running", waiting),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                session.cancel_remaining();
                break;
            }
            outcome = rx.recv() => {
                match outcome {
                    Some(outcome) => {
                        session.apply(outcome);
                        session.sweep().await?;
                    }
                    None => {
                        return Err(SpindleError::Stalled {
                            details: "outcome channel closed".to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(failure) = &session.first_failure {
        events.emit(EventKind::SessionFailed {
            error: failure.error.clone(),
            failed_task: Some(Arc::clone(&failure.task)),
        });
    } else if session.states.contains(&ExecState::Cancelled) {
        events.emit(EventKind::SessionFailed {
            error: "session cancelled".to_string(),
            failed_task: None,
        });
    } else {
        events.emit(EventKind::SessionCompleted {
            total_duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    let mut outputs = BTreeMap::new();
    for (name, reference) in workflow.declared_outputs() {
        if session.store.is_success(reference.producer) {
            if let Some(value) = session.store.get_output(reference.producer, &reference.slot) {
                outputs.insert(name.to_string(), value);
            }
        }
    }

    Ok(SessionOutcome {
        states: session.states,
        store: session.store,
        outputs,
        first_failure: session.first_failure,
    })
}

/// Fill declared workflow inputs from provided values and defaults,
/// checking presence and kind
fn merge_workflow_inputs(
    workflow: &Workflow,
    provided: TaskInputs,
) -> Result<TaskInputs, SpindleError> {
    let mut merged = provided;
    for def in workflow.input_defs() {
        match merged.get(def.name.as_ref()) {
            Some(value) => {
                if !def.kind.admits(value) {
                    return Err(SpindleError::LiteralKindMismatch {
                        task: Arc::clone(workflow.name()),
                        slot: Arc::clone(&def.name),
                        kind: def.kind,
                    });
                }
            }
            None => match &def.default {
                Some(default) => {
                    merged.insert(def.name.to_string(), default.clone());
                }
                None => {
                    return Err(SpindleError::UnresolvedInput {
                        task: Arc::clone(workflow.name()),
                        slot: Arc::clone(&def.name),
                    });
                }
            },
        }
    }
    Ok(merged)
}

fn failure_message(failure: &UnitFailure) -> (String, bool) {
    match failure {
        UnitFailure::Task(message) => (message.clone(), false),
        UnitFailure::Dispatch(message) => (message.clone(), true),
    }
}

impl Session<'_> {
    /// Schedule everything that became eligible, to a fixpoint
    async fn sweep(&mut self) -> Result<(), SpindleError> {
        loop {
            let mut progressed = false;
            for i in 0..self.states.len() {
                if self.states[i] != ExecState::Pending {
                    continue;
                }
                let node = NodeId(i);
                let deps = self.graph.dependencies(node).to_vec();

                if let Some(&failed) = deps
                    .iter()
                    .find(|d| self.states[d.index()] == ExecState::Errored)
                {
                    self.inherit_failure(node, failed);
                    progressed = true;
                    continue;
                }
                if deps
                    .iter()
                    .any(|d| self.states[d.index()] == ExecState::Cancelled)
                {
                    self.mark_cancelled(node);
                    progressed = true;
                    continue;
                }
                if deps
                    .iter()
                    .all(|d| self.states[d.index()] == ExecState::Done)
                {
                    self.states[i] = ExecState::Ready;
                    let instance = self.workflow.instance(node).clone();
                    let inputs = self.resolve_inputs(&instance)?;
                    self.schedule_node(node, instance, inputs).await?;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Resolve every input slot of an instance against literals, session
    /// inputs, defaults, and upstream results
    fn resolve_inputs(&self, instance: &TaskInstance) -> Result<TaskInputs, SpindleError> {
        let mut resolved = TaskInputs::new();
        for slot in instance.spec.input_schema() {
            let value = match instance.bindings.get(&slot.name) {
                Some(Binding::Literal(value)) => value.clone(),
                Some(Binding::Input(name)) => self
                    .inputs
                    .get(name.as_ref())
                    .cloned()
                    .ok_or_else(|| SpindleError::UnresolvedInput {
                        task: Arc::clone(self.workflow.name()),
                        slot: Arc::clone(name),
                    })?,
                Some(Binding::Ref(reference)) => self
                    .store
                    .get_output(reference.producer, &reference.slot)
                    .ok_or_else(|| SpindleError::UnresolvedRef {
                        task: Arc::clone(
                            self.workflow.instance(reference.producer).spec.name(),
                        ),
                        slot: Arc::clone(&reference.slot),
                    })?,
                None => slot
                    .default
                    .clone()
                    .ok_or_else(|| SpindleError::UnresolvedInput {
                        task: Arc::clone(instance.spec.name()),
                        slot: Arc::clone(&slot.name),
                    })?,
            };
            resolved.insert(slot.name.to_string(), value);
        }
        Ok(resolved)
    }

    /// Expand, dedupe, and dispatch one eligible node
    async fn schedule_node(
        &mut self,
        node: NodeId,
        instance: TaskInstance,
        inputs: TaskInputs,
    ) -> Result<(), SpindleError> {
        let spec = Arc::clone(&instance.spec);
        let name = Arc::clone(spec.name());
        debug!(task = %name, "scheduling");

        let dep_names: Vec<Arc<str>> = self
            .graph
            .dependencies(node)
            .iter()
            .map(|d| Arc::clone(self.workflow.instance(*d).spec.name()))
            .collect();
        self.events.emit(EventKind::TaskScheduled {
            task_id: Arc::clone(&name),
            dependencies: dep_names,
        });

        let (units, dims, perm) = match &instance.split {
            Some(split) => {
                let expansion = expand(&name, split, &inputs)?;
                let perm = combine_permutation(&name, split, instance.combine.as_ref())?;
                self.events.emit(EventKind::SplitExpanded {
                    task_id: Arc::clone(&name),
                    unit_count: expansion.units.len(),
                });
                (expansion.units, expansion.dims, perm)
            }
            None => (
                vec![SubInstance {
                    index: Vec::new(),
                    inputs,
                }],
                Vec::new(),
                Vec::new(),
            ),
        };

        self.states[node.index()] = ExecState::Running;
        self.pending.insert(
            node,
            PendingNode {
                expected: units.len(),
                results: Vec::new(),
                dims,
                perm,
                split: instance.split.is_some(),
                started: Instant::now(),
            },
        );
        if units.is_empty() {
            // Zero-length split: Done with empty combined sequences
            self.finalize_node(node);
            return Ok(());
        }

        if matches!(spec.body(), TaskBody::Subflow(_)) {
            return self.run_subflow_units(node, &spec, units).await;
        }

        let mut batch = Vec::new();
        for unit in units {
            let identity = identity_hash(&name, &unit.inputs);
            let unit_id = UnitId {
                node,
                index: unit.index,
            };
            let label: Arc<str> = unit_label(&name, &unit_id.index).into();

            if self.cache_enabled {
                if let Some(outputs) = self.cache.get(identity) {
                    self.events.emit(EventKind::CacheHit {
                        task_id: label,
                        identity,
                    });
                    self.record_unit(unit_id, identity, Ok(outputs), Duration::ZERO);
                    continue;
                }
            }
            if self.inflight.contains_key(&identity) {
                // Identical execution already running; share its outcome
                self.followers.entry(identity).or_default().push(unit_id);
                continue;
            }
            self.inflight.insert(identity, unit_id.clone());
            self.events.emit(EventKind::TaskStarted {
                task_id: label,
                inputs: serde_json::to_value(&unit.inputs).unwrap_or(Value::Null),
            });
            batch.push(WorkUnit {
                unit: unit_id,
                spec: Arc::clone(&spec),
                inputs: unit.inputs,
                identity,
            });
        }

        if !batch.is_empty() {
            self.outstanding += batch.len();
            self.backend
                .dispatch(batch, self.tx.clone(), self.cancel.clone())
                .await;
        }
        Ok(())
    }

    /// Nested workflows run inline in the scheduler as child sessions;
    /// the backend only ever sees leaf tasks
    async fn run_subflow_units(
        &mut self,
        node: NodeId,
        spec: &Arc<TaskSpec>,
        units: Vec<SubInstance>,
    ) -> Result<(), SpindleError> {
        let name = Arc::clone(spec.name());
        for unit in units {
            let identity = identity_hash(&name, &unit.inputs);
            let unit_id = UnitId {
                node,
                index: unit.index,
            };
            let label: Arc<str> = unit_label(&name, &unit_id.index).into();

            if self.cache_enabled {
                if let Some(outputs) = self.cache.get(identity) {
                    self.events.emit(EventKind::CacheHit {
                        task_id: label,
                        identity,
                    });
                    self.record_unit(unit_id, identity, Ok(outputs), Duration::ZERO);
                    continue;
                }
            }

            self.events.emit(EventKind::TaskStarted {
                task_id: label,
                inputs: serde_json::to_value(&unit.inputs).unwrap_or(Value::Null),
            });
            let started = Instant::now();
            let result = match spec.body() {
                TaskBody::Subflow(child) => {
                    let outcome = run_session(
                        child,
                        unit.inputs,
                        self.backend,
                        self.cache.clone(),
                        self.cache_enabled,
                        self.events.clone(),
                        self.cancel.child_token(),
                    )
                    .await;
                    match outcome {
                        Ok(child_outcome) => match child_outcome.first_failure {
                            None => {
                                if self.cache_enabled {
                                    self.cache.insert(identity, child_outcome.outputs.clone());
                                }
                                Ok(child_outcome.outputs)
                            }
                            Some(failure) => Err(UnitFailure::Task(format!(
                                "{}: {}",
                                failure.task, failure.error
                            ))),
                        },
                        Err(e) => Err(UnitFailure::Task(e.to_string())),
                    }
                }
                _ => Err(UnitFailure::Dispatch(
                    "expected a nested workflow body".to_string(),
                )),
            };
            self.record_unit(unit_id, identity, result, started.elapsed());
        }
        Ok(())
    }

    /// Fan an outcome out to its primary unit and any followers
    fn apply(&mut self, outcome: UnitOutcome) {
        self.outstanding -= 1;
        self.inflight.remove(&outcome.identity);

        if let Ok(outputs) = &outcome.result {
            if self.cache_enabled {
                self.cache.insert(outcome.identity, outputs.clone());
            }
        }

        let mut targets = vec![outcome.unit];
        if let Some(followers) = self.followers.remove(&outcome.identity) {
            targets.extend(followers);
        }
        for unit in targets {
            self.record_unit(unit, outcome.identity, outcome.result.clone(), outcome.duration);
        }
    }

    fn record_unit(
        &mut self,
        unit: UnitId,
        identity: u64,
        result: Result<TaskOutputs, UnitFailure>,
        duration: Duration,
    ) {
        let name = Arc::clone(self.workflow.instance(unit.node).spec.name());
        let label: Arc<str> = unit_label(&name, &unit.index).into();
        match &result {
            Ok(outputs) => {
                self.events.emit(EventKind::TaskCompleted {
                    task_id: label,
                    output: serde_json::to_value(outputs).unwrap_or(Value::Null),
                    duration_ms: duration.as_millis() as u64,
                });
            }
            Err(failure) => {
                let (message, _) = failure_message(failure);
                self.events.emit(EventKind::TaskFailed {
                    task_id: label,
                    error: message,
                    duration_ms: duration.as_millis() as u64,
                });
            }
        }

        let complete = match self.pending.get_mut(&unit.node) {
            Some(pending) => {
                pending.results.push(ExecutionRecord {
                    index: unit.index,
                    identity,
                    result,
                    duration,
                });
                pending.results.len() == pending.expected
            }
            None => false,
        };
        if complete {
            self.finalize_node(unit.node);
        }
    }

    /// All units of a node are in: combine or fail the node as a whole
    fn finalize_node(&mut self, node: NodeId) {
        let Some(pending) = self.pending.remove(&node) else {
            return;
        };
        let instance = self.workflow.instance(node);
        let name = Arc::clone(instance.spec.name());
        let duration = pending.started.elapsed();

        let worst = pending
            .results
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|f| (&r.index, f)))
            .min_by(|a, b| a.0.cmp(b.0));
        if let Some((index, unit_failure)) = worst {
            let (error, dispatch) = failure_message(unit_failure);
            let failure = Failure {
                task: Arc::clone(&name),
                index: if pending.split {
                    Some(index.clone())
                } else {
                    None
                },
                error,
                dispatch,
            };
            if self.first_failure.is_none() {
                self.first_failure = Some(failure.clone());
            }
            self.store
                .insert(node, NodeResult::errored(failure, duration));
            self.states[node.index()] = ExecState::Errored;
            return;
        }

        let outputs = if pending.split {
            let slots: Vec<Arc<str>> = instance
                .spec
                .output_schema()
                .iter()
                .map(|s| Arc::clone(&s.name))
                .collect();
            let unit_count = pending.results.len();
            let results: Vec<(MultiIndex, TaskOutputs)> = pending
                .results
                .into_iter()
                .filter_map(|r| r.result.ok().map(|outputs| (r.index, outputs)))
                .collect();
            self.events.emit(EventKind::OutputsCombined {
                task_id: Arc::clone(&name),
                unit_count,
            });
            crate::split::combine_outputs(&pending.dims, &pending.perm, &slots, &results)
        } else {
            pending
                .results
                .into_iter()
                .next()
                .and_then(|r| r.result.ok())
                .unwrap_or_default()
        };

        self.store.insert(node, NodeResult::done(outputs, duration));
        self.states[node.index()] = ExecState::Done;
    }

    /// A dependency errored: this node inherits the origin failure
    fn inherit_failure(&mut self, node: NodeId, failed_dep: NodeId) {
        let origin = self
            .store
            .get(failed_dep)
            .and_then(|r| r.failure)
            .unwrap_or_else(|| Failure {
                task: Arc::clone(self.workflow.instance(failed_dep).spec.name()),
                index: None,
                error: "upstream task failed".to_string(),
                dispatch: false,
            });
        let name = Arc::clone(self.workflow.instance(node).spec.name());
        debug!(task = %name, origin = %origin.task, "inheriting upstream failure");
        self.events.emit(EventKind::TaskFailed {
            task_id: Arc::clone(&name),
            error: format!("upstream '{}' failed: {}", origin.task, origin.error),
            duration_ms: 0,
        });
        self.store
            .insert(node, NodeResult::errored(origin, Duration::ZERO));
        self.states[node.index()] = ExecState::Errored;
    }

    fn mark_cancelled(&mut self, node: NodeId) {
        let name = Arc::clone(self.workflow.instance(node).spec.name());
        self.events.emit(EventKind::TaskCancelled {
            task_id: Arc::clone(&name),
        });
        self.store.insert(node, NodeResult::cancelled());
        self.states[node.index()] = ExecState::Cancelled;
    }

    /// Session-level cancel: everything not yet terminal becomes Cancelled
    fn cancel_remaining(&mut self) {
        for i in 0..self.states.len() {
            if !self.states[i].is_terminal() {
                self.mark_cancelled(NodeId(i));
            }
        }
    }
}
