//! Task specifications: declared schemas plus an opaque body
//!
//! A [`TaskSpec`] is immutable once built and shared by `Arc`: construct it
//! once, reuse it as a template for any number of workflow instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandTemplate;
use crate::workflow::Workflow;

/// Resolved input values handed to a task body (sorted keys, deterministic)
pub type TaskInputs = BTreeMap<String, Value>;

/// Output values produced by a task body, keyed by output slot name
pub type TaskOutputs = BTreeMap<String, Value>;

/// Signature of a pure-function task body
pub type TaskFn = Arc<dyn Fn(&TaskInputs) -> Result<TaskOutputs, String> + Send + Sync>;

/// Declared kind of a slot value (runtime values are JSON)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Float,
    Str,
    Seq,
    Map,
}

impl ValueKind {
    /// Check whether a runtime value matches this declared kind
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Int => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_number(),
            ValueKind::Str => value.is_string(),
            ValueKind::Seq => value.is_array(),
            ValueKind::Map => value.is_object(),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::Seq => "seq",
            ValueKind::Map => "map",
        };
        write!(f, "{}", name)
    }
}

/// One declared input or output slot
#[derive(Debug, Clone)]
pub struct SlotDef {
    pub name: Arc<str>,
    pub kind: ValueKind,
    /// Default used when the slot has no binding (inputs only)
    pub default: Option<Value>,
}

impl SlotDef {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn with_default(name: &str, kind: ValueKind, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default.into()),
        }
    }
}

/// What actually runs when a task is dispatched
#[derive(Clone)]
pub enum TaskBody {
    /// In-process function
    Func(TaskFn),
    /// External process built from bound inputs
    Command(CommandTemplate),
    /// Nested workflow run as a child session
    Subflow(Box<Workflow>),
}

impl std::fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskBody::Func(_) => f.write_str("Func(..)"),
            TaskBody::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            TaskBody::Subflow(wf) => f.debug_tuple("Subflow").field(&wf.name()).finish(),
        }
    }
}

/// Immutable task template: identity, ordered schemas, body
#[derive(Debug, Clone)]
pub struct TaskSpec {
    name: Arc<str>,
    inputs: Vec<SlotDef>,
    outputs: Vec<SlotDef>,
    body: TaskBody,
}

impl TaskSpec {
    pub fn builder(name: &str) -> TaskSpecBuilder {
        TaskSpecBuilder {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        name: Arc<str>,
        inputs: Vec<SlotDef>,
        outputs: Vec<SlotDef>,
        body: TaskBody,
    ) -> Self {
        Self {
            name,
            inputs,
            outputs,
            body,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Declared inputs, in declaration order
    pub fn input_schema(&self) -> &[SlotDef] {
        &self.inputs
    }

    /// Declared outputs, in declaration order
    pub fn output_schema(&self) -> &[SlotDef] {
        &self.outputs
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub fn input_slot(&self, slot: &str) -> Option<&SlotDef> {
        self.inputs.iter().find(|s| s.name.as_ref() == slot)
    }

    pub fn output_slot(&self, slot: &str) -> Option<&SlotDef> {
        self.outputs.iter().find(|s| s.name.as_ref() == slot)
    }
}

/// Builder for [`TaskSpec`]; finish with `func` or `command`. Nested
/// workflows become task specs through [`Workflow::into_task`].
pub struct TaskSpecBuilder {
    name: Arc<str>,
    inputs: Vec<SlotDef>,
    outputs: Vec<SlotDef>,
}

impl TaskSpecBuilder {
    pub fn input(mut self, name: &str, kind: ValueKind) -> Self {
        self.inputs.push(SlotDef::new(name, kind));
        self
    }

    pub fn input_with_default(
        mut self,
        name: &str,
        kind: ValueKind,
        default: impl Into<Value>,
    ) -> Self {
        self.inputs.push(SlotDef::with_default(name, kind, default));
        self
    }

    pub fn output(mut self, name: &str, kind: ValueKind) -> Self {
        self.outputs.push(SlotDef::new(name, kind));
        self
    }

    /// Finish with an in-process function body
    pub fn func<F>(self, f: F) -> Arc<TaskSpec>
    where
        F: Fn(&TaskInputs) -> Result<TaskOutputs, String> + Send + Sync + 'static,
    {
        Arc::new(TaskSpec {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            body: TaskBody::Func(Arc::new(f)),
        })
    }

    /// Finish with an external-process body
    pub fn command(self, template: CommandTemplate) -> Arc<TaskSpec> {
        let mut outputs = self.outputs;
        if outputs.is_empty() {
            outputs = CommandTemplate::default_outputs();
        }
        Arc::new(TaskSpec {
            name: self.name,
            inputs: self.inputs,
            outputs,
            body: TaskBody::Command(template),
        })
    }
}

/// Shorthand for a single-output function task
pub fn task_fn<F>(
    name: &str,
    inputs: &[(&str, ValueKind)],
    output: (&str, ValueKind),
    f: F,
) -> Arc<TaskSpec>
where
    F: Fn(&TaskInputs) -> Result<Value, String> + Send + Sync + 'static,
{
    let out_name: Arc<str> = output.0.into();
    let mut builder = TaskSpec::builder(name);
    for (slot, kind) in inputs {
        builder = builder.input(slot, *kind);
    }
    let out_key = out_name.to_string();
    builder.output(&out_name, output.1).func(move |inputs| {
        let value = f(inputs)?;
        let mut outputs = TaskOutputs::new();
        outputs.insert(out_key.clone(), value);
        Ok(outputs)
    })
}

/// Anything with a declared input/output schema and a run contract:
/// leaf tasks and whole workflows both qualify, which is what lets a
/// workflow nest as a task inside another workflow.
pub trait Node {
    fn node_name(&self) -> &Arc<str>;
    fn input_schema(&self) -> &[SlotDef];
    fn output_schema(&self) -> &[SlotDef];
}

impl Node for TaskSpec {
    fn node_name(&self) -> &Arc<str> {
        &self.name
    }

    fn input_schema(&self) -> &[SlotDef] {
        &self.inputs
    }

    fn output_schema(&self) -> &[SlotDef] {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_preserves_declaration_order() {
        let spec = TaskSpec::builder("add")
            .input("a", ValueKind::Int)
            .input("b", ValueKind::Int)
            .output("sum", ValueKind::Int)
            .func(|_| Ok(TaskOutputs::new()));

        let names: Vec<&str> = spec
            .input_schema()
            .iter()
            .map(|s| s.name.as_ref())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(spec.output_schema()[0].name.as_ref(), "sum");
    }

    #[test]
    fn task_fn_wraps_single_output() {
        let spec = task_fn(
            "double",
            &[("x", ValueKind::Int)],
            ("out", ValueKind::Int),
            |inputs| {
                let x = inputs["x"].as_i64().ok_or("x must be an int")?;
                Ok(json!(x * 2))
            },
        );

        let mut inputs = TaskInputs::new();
        inputs.insert("x".to_string(), json!(21));

        match spec.body() {
            TaskBody::Func(f) => {
                let out = f(&inputs).unwrap();
                assert_eq!(out["out"], json!(42));
            }
            _ => panic!("expected function body"),
        }
    }

    #[test]
    fn value_kind_admits() {
        assert!(ValueKind::Int.admits(&json!(3)));
        assert!(!ValueKind::Int.admits(&json!(3.5)));
        assert!(ValueKind::Float.admits(&json!(3)));
        assert!(ValueKind::Seq.admits(&json!([1, 2])));
        assert!(!ValueKind::Seq.admits(&json!("abc")));
        assert!(ValueKind::Any.admits(&json!(null)));
    }

    #[test]
    fn slot_lookup_by_name() {
        let spec = task_fn(
            "t",
            &[("a", ValueKind::Any)],
            ("o", ValueKind::Any),
            |_| Ok(json!(null)),
        );
        assert!(spec.input_slot("a").is_some());
        assert!(spec.input_slot("z").is_none());
        assert!(spec.output_slot("o").is_some());
    }
}
