//! Spindle - task-graph execution engine for scientific pipelines

pub mod backend;
pub mod binding;
pub mod command;
pub mod error;
pub mod event;
pub mod graph;
pub mod record;
mod scheduler;
pub mod split;
pub mod store;
pub mod submitter;
pub mod task;
pub mod workflow;

pub use backend::{
    BackendKind, ExecutorBackend, PoolBackend, SequentialBackend, SubprocessBackend, UnitFailure,
    UnitOutcome, WorkUnit,
};
pub use binding::{Binding, LazyOutputRef, NodeId};
pub use command::{ArgTemplate, CommandTemplate};
pub use error::{FixSuggestion, SpindleError};
pub use event::{Event, EventKind, EventLog};
pub use graph::DepGraph;
pub use record::{ExecState, ExecutionRecord, UnitId};
pub use split::{CombineSpec, MultiIndex, SplitSpec};
pub use store::{Failure, NodeResult, ResultCache, ResultStore};
pub use submitter::{RunReport, Submitter, SubmitterConfig};
pub use task::{
    task_fn, Node, SlotDef, TaskBody, TaskFn, TaskInputs, TaskOutputs, TaskSpec, TaskSpecBuilder,
    ValueKind,
};
pub use workflow::{TaskHandle, TaskInstance, Workflow};
