//! Workflow construction: registering tasks, wiring bindings, declaring
//! outputs
//!
//! Construction is eager about everything it can check locally (slot
//! names, rebinds, forward references); [`Workflow::validate`] checks the
//! whole graph, including literal kinds against split declarations, and is
//! idempotent, so callers can validate at any point without mutating the
//! workflow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::binding::{Binding, LazyOutputRef, NodeId};
use crate::error::SpindleError;
use crate::graph::{cycle_error, DepGraph};
use crate::split::{combine_permutation, CombineSpec, SplitSpec};
use crate::task::{Node, SlotDef, TaskBody, TaskSpec, ValueKind};

/// One registered task within a workflow: a shared spec plus this
/// instance's bindings and split/combine configuration
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub(crate) id: NodeId,
    pub(crate) spec: Arc<TaskSpec>,
    pub(crate) bindings: HashMap<Arc<str>, Binding>,
    pub(crate) split: Option<SplitSpec>,
    pub(crate) combine: Option<CombineSpec>,
}

/// Each workflow gets a process-unique id so handles can be traced back
/// to the workflow that minted them
static NEXT_WORKFLOW_UID: AtomicU64 = AtomicU64::new(0);

/// Handle returned by [`Workflow::register`]: the caller's only way to
/// name a task instance and to mint lazy references to its outputs.
///
/// A handle is only valid with the workflow that registered it; using it
/// elsewhere is a [`SpindleError::ForeignHandle`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: NodeId,
    workflow: u64,
    spec: Arc<TaskSpec>,
}

impl TaskHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        self.spec.name()
    }

    /// Mint a lazy reference to one of this task's declared outputs
    pub fn output(&self, slot: &str) -> Result<LazyOutputRef, SpindleError> {
        if self.spec.output_slot(slot).is_none() {
            return Err(SpindleError::UnknownSlot {
                task: Arc::clone(self.spec.name()),
                slot: slot.to_string(),
            });
        }
        Ok(LazyOutputRef {
            producer: self.id,
            slot: slot.into(),
        })
    }
}

/// A named collection of task instances wired by bindings.
///
/// A workflow is itself a [`Node`]: `into_task` turns it into a task spec
/// that can be registered inside another workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: Arc<str>,
    uid: u64,
    inputs: Vec<SlotDef>,
    tasks: Vec<TaskInstance>,
    by_name: HashMap<Arc<str>, NodeId>,
    outputs: Vec<(Arc<str>, LazyOutputRef)>,
    output_defs: Vec<SlotDef>,
}

impl Workflow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            uid: NEXT_WORKFLOW_UID.fetch_add(1, Ordering::Relaxed),
            inputs: Vec::new(),
            tasks: Vec::new(),
            by_name: HashMap::new(),
            outputs: Vec::new(),
            output_defs: Vec::new(),
        }
    }

    /// Handles carry the uid of the workflow that minted them; any other
    /// workflow refuses them instead of indexing the wrong task
    fn own_handle(&self, task: &TaskHandle) -> Result<(), SpindleError> {
        if task.workflow != self.uid {
            return Err(SpindleError::ForeignHandle {
                task: Arc::clone(task.spec.name()),
                workflow: Arc::clone(&self.name),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Declare a workflow-level input slot
    pub fn add_input(&mut self, name: &str, kind: ValueKind) -> &mut Self {
        self.inputs.push(SlotDef::new(name, kind));
        self
    }

    /// Declare a workflow-level input slot with a default value
    pub fn add_input_with_default(
        &mut self,
        name: &str,
        kind: ValueKind,
        default: impl Into<Value>,
    ) -> &mut Self {
        self.inputs.push(SlotDef::with_default(name, kind, default));
        self
    }

    /// Register a task instance. Registration order is the only order the
    /// workflow knows; references can only point backwards through it.
    pub fn register(&mut self, spec: Arc<TaskSpec>) -> Result<TaskHandle, SpindleError> {
        if self.by_name.contains_key(spec.name()) {
            return Err(SpindleError::DuplicateTask {
                name: Arc::clone(spec.name()),
            });
        }
        let id = NodeId(self.tasks.len());
        self.by_name.insert(Arc::clone(spec.name()), id);
        self.tasks.push(TaskInstance {
            id,
            spec: Arc::clone(&spec),
            bindings: HashMap::new(),
            split: None,
            combine: None,
        });
        Ok(TaskHandle {
            id,
            workflow: self.uid,
            spec,
        })
    }

    /// Bind one input slot of a registered task. Each slot binds at most
    /// once; values are immutable once bound.
    pub fn bind(
        &mut self,
        task: &TaskHandle,
        slot: &str,
        binding: Binding,
    ) -> Result<&mut Self, SpindleError> {
        self.own_handle(task)?;
        let slot_def = task
            .spec
            .input_slot(slot)
            .ok_or_else(|| SpindleError::UnknownSlot {
                task: Arc::clone(task.spec.name()),
                slot: slot.to_string(),
            })?
            .clone();

        match &binding {
            // Literal kinds are checked in validate(), where split
            // declarations are known: a split slot legitimately binds a
            // sequence of its declared kind
            Binding::Literal(_) => {}
            Binding::Ref(reference) => {
                // A reference can only point to an earlier registration;
                // this makes cycles unrepresentable through the public API
                if reference.producer.index() >= task.id.index() {
                    let producer = self
                        .tasks
                        .get(reference.producer.index())
                        .map(|t| Arc::clone(t.spec.name()))
                        .unwrap_or_else(|| Arc::from("<unregistered>"));
                    return Err(SpindleError::ForwardReference {
                        task: Arc::clone(task.spec.name()),
                        producer,
                    });
                }
                let producer = &self.tasks[reference.producer.index()];
                if producer.spec.output_slot(&reference.slot).is_none() {
                    return Err(SpindleError::UnknownSlot {
                        task: Arc::clone(producer.spec.name()),
                        slot: reference.slot.to_string(),
                    });
                }
            }
            Binding::Input(input) => {
                if !self.inputs.iter().any(|s| s.name == *input) {
                    return Err(SpindleError::UnknownInput {
                        task: Arc::clone(task.spec.name()),
                        input: Arc::clone(input),
                    });
                }
            }
        }

        let instance = &mut self.tasks[task.id.index()];
        if instance.bindings.contains_key(&slot_def.name) {
            return Err(SpindleError::RebindSlot {
                task: Arc::clone(task.spec.name()),
                slot: slot_def.name,
            });
        }
        instance.bindings.insert(slot_def.name, binding);
        Ok(self)
    }

    /// Bind a literal value (shorthand for `bind` with `Binding::Literal`)
    pub fn bind_literal(
        &mut self,
        task: &TaskHandle,
        slot: &str,
        value: impl Into<Value>,
    ) -> Result<&mut Self, SpindleError> {
        self.bind(task, slot, Binding::Literal(value.into()))
    }

    /// Declare a split over one or more of the task's input slots
    pub fn split(
        &mut self,
        task: &TaskHandle,
        split: SplitSpec,
    ) -> Result<&mut Self, SpindleError> {
        self.own_handle(task)?;
        for slot in split.slots() {
            if task.spec.input_slot(slot).is_none() {
                return Err(SpindleError::UnknownSlot {
                    task: Arc::clone(task.spec.name()),
                    slot: slot.to_string(),
                });
            }
        }
        self.tasks[task.id.index()].split = Some(split);
        Ok(self)
    }

    /// Declare the nesting order for a split task's combined outputs
    pub fn combine(
        &mut self,
        task: &TaskHandle,
        combine: CombineSpec,
    ) -> Result<&mut Self, SpindleError> {
        self.own_handle(task)?;
        let instance = &mut self.tasks[task.id.index()];
        let Some(split) = &instance.split else {
            return Err(SpindleError::InvalidSplitInput {
                task: Arc::clone(task.spec.name()),
                slot: combine
                    .dims
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Arc::from("")),
                details: "combine declared on a task that has no split".to_string(),
            });
        };
        combine_permutation(task.spec.name(), split, Some(&combine))?;
        instance.combine = Some(combine);
        Ok(self)
    }

    /// Expose one task output as a workflow output
    pub fn declare_output(
        &mut self,
        name: &str,
        reference: LazyOutputRef,
    ) -> Result<&mut Self, SpindleError> {
        if self.outputs.iter().any(|(n, _)| n.as_ref() == name) {
            return Err(SpindleError::DuplicateOutput {
                name: name.to_string(),
            });
        }
        let producer = self.tasks.get(reference.producer.index()).ok_or_else(|| {
            SpindleError::ForeignHandle {
                task: Arc::from("<unregistered>"),
                workflow: Arc::clone(&self.name),
            }
        })?;
        let slot = producer
            .spec
            .output_slot(&reference.slot)
            .ok_or_else(|| SpindleError::UnknownSlot {
                task: Arc::clone(producer.spec.name()),
                slot: reference.slot.to_string(),
            })?;
        // Split outputs surface as sequences downstream
        let kind = if producer.split.is_some() {
            ValueKind::Seq
        } else {
            slot.kind
        };
        self.output_defs.push(SlotDef::new(name, kind));
        self.outputs.push((name.into(), reference));
        Ok(self)
    }

    /// Check the whole workflow: every required slot bound or defaulted,
    /// literal kinds coherent with declarations and splits, graph acyclic.
    /// Idempotent.
    pub fn validate(&self) -> Result<(), SpindleError> {
        for instance in &self.tasks {
            let split_slots: &[Arc<str>] = instance
                .split
                .as_ref()
                .map(|s| s.slots())
                .unwrap_or(&[]);
            for slot in instance.spec.input_schema() {
                match instance.bindings.get(&slot.name) {
                    Some(Binding::Literal(value)) => {
                        let ok = if split_slots.contains(&slot.name) {
                            // A split slot binds a sequence whose elements
                            // must match the declared kind; non-sequence
                            // values fail at expansion as InvalidSplitInput
                            match value.as_array() {
                                Some(items) => items.iter().all(|v| slot.kind.admits(v)),
                                None => true,
                            }
                        } else {
                            slot.kind.admits(value)
                        };
                        if !ok {
                            return Err(SpindleError::LiteralKindMismatch {
                                task: Arc::clone(instance.spec.name()),
                                slot: Arc::clone(&slot.name),
                                kind: slot.kind,
                            });
                        }
                    }
                    Some(_) => {}
                    None => {
                        if slot.default.is_none() {
                            return Err(SpindleError::UnresolvedInput {
                                task: Arc::clone(instance.spec.name()),
                                slot: Arc::clone(&slot.name),
                            });
                        }
                    }
                }
            }
            if let Some(split) = &instance.split {
                combine_permutation(instance.spec.name(), split, instance.combine.as_ref())?;
            }
        }

        let graph = DepGraph::from_workflow(self);
        graph
            .topo_order()
            .map_err(|members| cycle_error(self, members))?;
        Ok(())
    }

    /// Close the workflow into a task spec so it can nest inside another
    /// workflow. The workflow's declared inputs and outputs become the
    /// task's schemas.
    pub fn into_task(self) -> Result<Arc<TaskSpec>, SpindleError> {
        self.validate()?;
        Ok(Arc::new(TaskSpec::from_parts(
            Arc::clone(&self.name),
            self.inputs.clone(),
            self.output_defs.clone(),
            TaskBody::Subflow(Box::new(self)),
        )))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn instance(&self, id: NodeId) -> &TaskInstance {
        &self.tasks[id.index()]
    }

    pub(crate) fn instances(&self) -> &[TaskInstance] {
        &self.tasks
    }

    pub(crate) fn declared_outputs(&self) -> &[(Arc<str>, LazyOutputRef)] {
        &self.outputs
    }

    pub(crate) fn input_defs(&self) -> &[SlotDef] {
        &self.inputs
    }
}

impl Node for Workflow {
    fn node_name(&self) -> &Arc<str> {
        &self.name
    }

    fn input_schema(&self) -> &[SlotDef] {
        &self.inputs
    }

    fn output_schema(&self) -> &[SlotDef] {
        &self.output_defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{task_fn, TaskOutputs};
    use serde_json::json;

    fn add_spec() -> Arc<TaskSpec> {
        task_fn(
            "add",
            &[("a", ValueKind::Int), ("b", ValueKind::Int)],
            ("out", ValueKind::Int),
            |inputs| {
                let a = inputs["a"].as_i64().ok_or("a must be an int")?;
                let b = inputs["b"].as_i64().ok_or("b must be an int")?;
                Ok(json!(a + b))
            },
        )
    }

    fn mul_spec() -> Arc<TaskSpec> {
        task_fn(
            "mul",
            &[("a", ValueKind::Int), ("b", ValueKind::Int)],
            ("out", ValueKind::Int),
            |inputs| {
                let a = inputs["a"].as_i64().ok_or("a must be an int")?;
                let b = inputs["b"].as_i64().ok_or("b must be an int")?;
                Ok(json!(a * b))
            },
        )
    }

    #[test]
    fn duplicate_task_names_rejected() {
        let mut wf = Workflow::new("w");
        wf.register(add_spec()).unwrap();
        let err = wf.register(add_spec()).unwrap_err();
        assert!(matches!(err, SpindleError::DuplicateTask { .. }));
    }

    #[test]
    fn bind_rejects_unknown_slot_and_rebind() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();

        let err = wf.bind_literal(&add, "nope", 1).unwrap_err();
        assert!(matches!(err, SpindleError::UnknownSlot { .. }));

        wf.bind_literal(&add, "a", 1).unwrap();
        let err = wf.bind_literal(&add, "a", 2).unwrap_err();
        assert!(matches!(err, SpindleError::RebindSlot { .. }));
    }

    #[test]
    fn literal_kind_is_checked_at_validate() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();
        wf.bind_literal(&add, "a", "three").unwrap();
        wf.bind_literal(&add, "b", 2).unwrap();
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, SpindleError::LiteralKindMismatch { .. }));
    }

    #[test]
    fn split_slot_accepts_a_sequence_of_its_kind() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();
        wf.bind_literal(&add, "a", json!([1, 2, 3])).unwrap();
        wf.bind_literal(&add, "b", 10).unwrap();
        wf.split(&add, SplitSpec::outer(&["a"])).unwrap();
        wf.validate().unwrap();

        // Element kinds still hold inside the sequence
        let mut bad = Workflow::new("w2");
        let add = bad.register(add_spec()).unwrap();
        bad.bind_literal(&add, "a", json!([1, "two"])).unwrap();
        bad.bind_literal(&add, "b", 10).unwrap();
        bad.split(&add, SplitSpec::outer(&["a"])).unwrap();
        let err = bad.validate().unwrap_err();
        assert!(matches!(err, SpindleError::LiteralKindMismatch { .. }));
    }

    #[test]
    fn forward_reference_rejected() {
        let mut wf = Workflow::new("w");
        let first = wf.register(add_spec()).unwrap();
        // A task cannot consume its own output
        let err = wf
            .bind(&first, "a", first.output("out").unwrap().into())
            .unwrap_err();
        assert!(matches!(err, SpindleError::ForwardReference { .. }));
    }

    #[test]
    fn validate_catches_unbound_required_slot() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();
        wf.bind_literal(&add, "a", 1).unwrap();
        let err = wf.validate().unwrap_err();
        match err {
            SpindleError::UnresolvedInput { task, slot } => {
                assert_eq!(task.as_ref(), "add");
                assert_eq!(slot.as_ref(), "b");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn default_satisfies_unbound_slot() {
        let spec = TaskSpec::builder("inc")
            .input("x", ValueKind::Int)
            .input_with_default("by", ValueKind::Int, 1)
            .output("out", ValueKind::Int)
            .func(|inputs| {
                let mut out = TaskOutputs::new();
                out.insert(
                    "out".to_string(),
                    json!(inputs["x"].as_i64().unwrap_or(0) + inputs["by"].as_i64().unwrap_or(0)),
                );
                Ok(out)
            });

        let mut wf = Workflow::new("w");
        let inc = wf.register(spec).unwrap();
        wf.bind_literal(&inc, "x", 5).unwrap();
        wf.validate().unwrap();
    }

    #[test]
    fn workflow_input_binding_must_be_declared() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();
        let err = wf.bind(&add, "a", Binding::input("x")).unwrap_err();
        assert!(matches!(err, SpindleError::UnknownInput { .. }));

        wf.add_input("x", ValueKind::Int);
        wf.bind(&add, "a", Binding::input("x")).unwrap();
    }

    #[test]
    fn declared_outputs_are_unique_and_checked() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();
        wf.bind_literal(&add, "a", 1).unwrap();
        wf.bind_literal(&add, "b", 2).unwrap();

        let err = add.output("missing").unwrap_err();
        assert!(matches!(err, SpindleError::UnknownSlot { .. }));

        wf.declare_output("sum", add.output("out").unwrap()).unwrap();
        let err = wf
            .declare_output("sum", add.output("out").unwrap())
            .unwrap_err();
        assert!(matches!(err, SpindleError::DuplicateOutput { .. }));
    }

    #[test]
    fn split_slots_must_exist_and_combine_needs_split() {
        let mut wf = Workflow::new("w");
        let add = wf.register(add_spec()).unwrap();

        let err = wf.split(&add, SplitSpec::outer(&["nope"])).unwrap_err();
        assert!(matches!(err, SpindleError::UnknownSlot { .. }));

        let err = wf.combine(&add, CombineSpec::over(&["a"])).unwrap_err();
        assert!(matches!(err, SpindleError::InvalidSplitInput { .. }));

        wf.split(&add, SplitSpec::outer(&["a", "b"])).unwrap();
        wf.combine(&add, CombineSpec::over(&["b", "a"])).unwrap();
    }

    #[test]
    fn handle_from_another_workflow_is_rejected() {
        let mut wf = Workflow::new("w");
        wf.register(add_spec()).unwrap();

        let mut other = Workflow::new("other");
        let foreign = other.register(add_spec()).unwrap();

        let err = wf.bind_literal(&foreign, "a", 1).unwrap_err();
        assert!(matches!(err, SpindleError::ForeignHandle { .. }));
        let err = wf.split(&foreign, SplitSpec::outer(&["a"])).unwrap_err();
        assert!(matches!(err, SpindleError::ForeignHandle { .. }));
        let err = wf.combine(&foreign, CombineSpec::all()).unwrap_err();
        assert!(matches!(err, SpindleError::ForeignHandle { .. }));
    }

    #[test]
    fn declare_output_rejects_reference_outside_the_workflow() {
        let mut wf = Workflow::new("w");
        wf.register(add_spec()).unwrap();

        let mut other = Workflow::new("other");
        other.register(add_spec()).unwrap();
        let busy = other.register(mul_spec()).unwrap();

        // Minted by a workflow with more tasks than this one has
        let err = wf
            .declare_output("sum", busy.output("out").unwrap())
            .unwrap_err();
        assert!(matches!(err, SpindleError::ForeignHandle { .. }));
    }

    #[test]
    fn validate_reports_cycles_in_internal_wiring() {
        // References can only point backwards through the public API, so
        // close a loop directly through the instance bindings
        let mut wf = Workflow::new("w");
        let first = wf.register(add_spec()).unwrap();
        wf.bind_literal(&first, "b", 1).unwrap();
        let second = wf.register(mul_spec()).unwrap();
        wf.bind(&second, "a", first.output("out").unwrap().into())
            .unwrap();
        wf.bind_literal(&second, "b", 2).unwrap();

        wf.tasks[first.id().index()].bindings.insert(
            Arc::from("a"),
            Binding::Ref(LazyOutputRef {
                producer: second.id(),
                slot: Arc::from("out"),
            }),
        );

        let err = wf.validate().unwrap_err();
        match err {
            SpindleError::GraphCycle { members } => {
                assert!(members.iter().any(|m| m == "add"));
                assert!(members.iter().any(|m| m == "mul"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn into_task_exposes_workflow_schemas() {
        let mut wf = Workflow::new("inner");
        wf.add_input("x", ValueKind::Int);
        let add = wf.register(add_spec()).unwrap();
        wf.bind(&add, "a", Binding::input("x")).unwrap();
        wf.bind_literal(&add, "b", 10).unwrap();
        wf.declare_output("total", add.output("out").unwrap())
            .unwrap();

        let spec = wf.into_task().unwrap();
        assert_eq!(spec.name().as_ref(), "inner");
        assert!(spec.input_slot("x").is_some());
        assert!(spec.output_slot("total").is_some());
        assert!(matches!(spec.body(), TaskBody::Subflow(_)));
    }
}
