//! Error types with fix suggestions

use std::sync::Arc;

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum SpindleError {
    // ─────────────────────────────────────────────────────────────
    // Graph construction errors (synchronous, fatal to the build)
    // ─────────────────────────────────────────────────────────────
    #[error("duplicate task name '{name}' in workflow")]
    DuplicateTask { name: Arc<str> },

    #[error("task '{task}' has no slot named '{slot}'")]
    UnknownSlot { task: Arc<str>, slot: String },

    #[error("handle for task '{task}' does not belong to workflow '{workflow}'")]
    ForeignHandle { task: Arc<str>, workflow: Arc<str> },

    #[error("slot '{slot}' on task '{task}' is already bound")]
    RebindSlot { task: Arc<str>, slot: Arc<str> },

    #[error("task '{task}' references '{producer}', which is not registered before it")]
    ForwardReference { task: Arc<str>, producer: Arc<str> },

    #[error("task '{task}' binds unknown workflow input '{input}'")]
    UnknownInput { task: Arc<str>, input: Arc<str> },

    #[error("workflow output '{name}' is already declared")]
    DuplicateOutput { name: String },

    #[error("literal bound to '{task}.{slot}' does not match declared kind {kind}")]
    LiteralKindMismatch {
        task: Arc<str>,
        slot: Arc<str>,
        kind: crate::task::ValueKind,
    },

    // ─────────────────────────────────────────────────────────────
    // Validation errors
    // ─────────────────────────────────────────────────────────────
    #[error("dependency cycle through tasks: {}", .members.join(" -> "))]
    GraphCycle { members: Vec<String> },

    #[error("required input '{slot}' on '{task}' has no binding and no default")]
    UnresolvedInput { task: Arc<str>, slot: Arc<str> },

    #[error("invalid split input on '{task}.{slot}': {details}")]
    InvalidSplitInput {
        task: Arc<str>,
        slot: Arc<str>,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Execution errors
    // ─────────────────────────────────────────────────────────────
    #[error("task '{task}'{} failed: {message}", index_suffix(.index.as_deref()))]
    TaskRuntime {
        task: Arc<str>,
        index: Option<String>,
        message: String,
    },

    #[error("executor backend '{backend}' failed: {message}")]
    BackendDispatch {
        backend: &'static str,
        message: String,
    },

    #[error("output '{output}' has not been produced (task not yet run)")]
    NotRun { output: String },

    #[error("session cancelled")]
    Cancelled,

    #[error("output '{slot}' of '{task}' read before the producer completed")]
    UnresolvedRef { task: Arc<str>, slot: Arc<str> },

    #[error("scheduler stalled: {details}")]
    Stalled { details: String },

    #[error("unknown backend key '{key}'")]
    UnknownBackend { key: String },
}

fn index_suffix(index: Option<&str>) -> String {
    match index {
        Some(idx) => format!(" at split index {}", idx),
        None => String::new(),
    }
}

impl FixSuggestion for SpindleError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            SpindleError::DuplicateTask { .. } => {
                Some("Give each task a unique name within its workflow")
            }
            SpindleError::UnknownSlot { .. } => {
                Some("Check the slot name against the task's declared schema")
            }
            SpindleError::ForeignHandle { .. } => {
                Some("Use a handle only with the workflow whose register() call produced it")
            }
            SpindleError::RebindSlot { .. } => {
                Some("Each required slot can be bound exactly once")
            }
            SpindleError::ForwardReference { .. } => {
                Some("Register producer tasks before the tasks that consume them")
            }
            SpindleError::UnknownInput { .. } => {
                Some("Declare the workflow input with add_input() before binding to it")
            }
            SpindleError::DuplicateOutput { .. } => Some("Use unique names for declared outputs"),
            SpindleError::LiteralKindMismatch { .. } => {
                Some("Bind a value matching the slot's declared kind, or declare the slot as Any")
            }
            SpindleError::GraphCycle { .. } => {
                Some("Remove the circular dependency - tasks cannot depend on their own outputs")
            }
            SpindleError::UnresolvedInput { .. } => {
                Some("Bind the slot, give it a default, or pass it as a workflow input")
            }
            SpindleError::InvalidSplitInput { .. } => {
                Some("Split slots must be bound to sequences; inner splits need equal lengths")
            }
            SpindleError::TaskRuntime { .. } => None,
            SpindleError::BackendDispatch { .. } => {
                Some("The execution substrate failed, not the task body - check worker resources")
            }
            SpindleError::NotRun { .. } => {
                Some("Submit the workflow before reading results, and check the output name")
            }
            SpindleError::Cancelled => None,
            SpindleError::UnresolvedRef { .. } => {
                Some("Lazy references resolve through the result store only after the producer is Done")
            }
            SpindleError::Stalled { .. } => None,
            SpindleError::UnknownBackend { .. } => {
                Some("Valid backend keys: sequential, concurrent-pool, subprocess")
            }
        }
    }
}
