//! Submission front end: owns the backend, the memoization cache, and the
//! cancel token; turns finished sessions into queryable reports

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{BackendKind, ExecutorBackend};
use crate::binding::Binding;
use crate::error::SpindleError;
use crate::event::EventLog;
use crate::record::{format_index, ExecState};
use crate::scheduler::run_session;
use crate::store::{Failure, ResultCache};
use crate::task::{TaskInputs, TaskSpec};
use crate::workflow::Workflow;

/// Declarative submitter configuration, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    pub backend: BackendKind,
    /// Worker limit for the pool backend; defaults to available cores
    pub concurrency: Option<usize>,
    pub cache: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::ConcurrentPool,
            concurrency: None,
            cache: true,
        }
    }
}

/// Entry point for running workflows and standalone tasks.
///
/// The memoization cache lives here, not in the session: two submissions
/// through the same submitter share cached results.
pub struct Submitter {
    kind: BackendKind,
    backend: Box<dyn ExecutorBackend>,
    cache: ResultCache,
    cache_enabled: bool,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Submitter {
    pub fn new(kind: BackendKind) -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            kind,
            backend: kind.build(concurrency),
            cache: ResultCache::new(),
            cache_enabled: true,
            concurrency,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: SubmitterConfig) -> Self {
        let mut submitter = Self::new(config.backend);
        if let Some(concurrency) = config.concurrency {
            submitter = submitter.with_concurrency(concurrency);
        }
        submitter.cache_enabled = config.cache;
        submitter
    }

    /// Rebuild the backend with an explicit worker limit
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.backend = self.kind.build(self.concurrency);
        self
    }

    /// Disable memoization: every unit runs even if an identical one ran
    /// before
    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Token observed by every session this submitter runs
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all in-flight sessions
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run a workflow to completion with the given input values
    pub async fn submit(
        &self,
        workflow: &Workflow,
        inputs: TaskInputs,
    ) -> Result<RunReport, SpindleError> {
        let events = EventLog::new();
        let started = Instant::now();
        info!(workflow = %workflow.name(), backend = self.backend.name(), "submitting");

        let outcome = run_session(
            workflow,
            inputs,
            self.backend.as_ref(),
            self.cache.clone(),
            self.cache_enabled,
            events.clone(),
            self.cancel.child_token(),
        )
        .await?;

        let mut states = BTreeMap::new();
        for (i, state) in outcome.states.iter().enumerate() {
            let name = workflow
                .instance(crate::binding::NodeId(i))
                .spec
                .name()
                .to_string();
            states.insert(name, *state);
        }

        let mut output_states = BTreeMap::new();
        let mut output_failures = BTreeMap::new();
        for (name, reference) in workflow.declared_outputs() {
            if let Some(result) = outcome.store.get(reference.producer) {
                output_states.insert(name.to_string(), result.state);
                if let Some(failure) = result.failure {
                    output_failures.insert(name.to_string(), failure);
                }
            }
        }

        Ok(RunReport {
            workflow: Arc::clone(workflow.name()),
            backend: self.backend.name(),
            outputs: outcome.outputs,
            output_states,
            output_failures,
            states,
            first_failure: outcome.first_failure,
            duration: started.elapsed(),
            events,
        })
    }

    /// Run one task on its own: the spec is wrapped in a single-node
    /// workflow whose inputs and outputs mirror the task's schemas, so a
    /// standalone run and an embedded run go through the same machinery.
    pub async fn submit_task(
        &self,
        spec: &Arc<TaskSpec>,
        inputs: TaskInputs,
    ) -> Result<RunReport, SpindleError> {
        let mut workflow = Workflow::new(spec.name());
        for slot in spec.input_schema() {
            match &slot.default {
                Some(default) => {
                    workflow.add_input_with_default(&slot.name, slot.kind, default.clone());
                }
                None => {
                    workflow.add_input(&slot.name, slot.kind);
                }
            }
        }
        let handle = workflow.register(Arc::clone(spec))?;
        for slot in spec.input_schema() {
            workflow.bind(&handle, &slot.name, Binding::Input(Arc::clone(&slot.name)))?;
        }
        for slot in spec.output_schema() {
            workflow.declare_output(&slot.name, handle.output(&slot.name)?)?;
        }
        self.submit(&workflow, inputs).await
    }
}

impl Drop for Submitter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("backend", &self.backend.name())
            .field("concurrency", &self.concurrency)
            .field("cache_enabled", &self.cache_enabled)
            .finish()
    }
}

/// Everything a finished submission can tell the caller
#[derive(Debug)]
pub struct RunReport {
    workflow: Arc<str>,
    backend: &'static str,
    outputs: BTreeMap<String, Value>,
    output_states: BTreeMap<String, ExecState>,
    output_failures: BTreeMap<String, Failure>,
    states: BTreeMap<String, ExecState>,
    first_failure: Option<Failure>,
    duration: Duration,
    events: EventLog,
}

impl RunReport {
    pub fn workflow(&self) -> &Arc<str> {
        &self.workflow
    }

    /// Read one declared output, or the error that explains its absence
    pub fn result(&self, output: &str) -> Result<&Value, SpindleError> {
        if let Some(value) = self.outputs.get(output) {
            return Ok(value);
        }
        match self.output_states.get(output) {
            Some(ExecState::Errored) => {
                let failure =
                    self.output_failures
                        .get(output)
                        .ok_or_else(|| SpindleError::NotRun {
                            output: output.to_string(),
                        })?;
                if failure.dispatch {
                    Err(SpindleError::BackendDispatch {
                        backend: self.backend,
                        message: failure.error.clone(),
                    })
                } else {
                    Err(SpindleError::TaskRuntime {
                        task: Arc::clone(&failure.task),
                        index: failure.index.as_ref().map(format_index),
                        message: failure.error.clone(),
                    })
                }
            }
            Some(ExecState::Cancelled) => Err(SpindleError::Cancelled),
            _ => Err(SpindleError::NotRun {
                output: output.to_string(),
            }),
        }
    }

    /// All resolved outputs
    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Final state of one task, by name
    pub fn state(&self, task: &str) -> Option<ExecState> {
        self.states.get(task).copied()
    }

    /// Final states of all tasks
    pub fn states(&self) -> &BTreeMap<String, ExecState> {
        &self.states
    }

    /// Origin of the first failure, if any task errored
    pub fn first_failure(&self) -> Option<&Failure> {
        self.first_failure.as_ref()
    }

    /// True when every task finished Done
    pub fn succeeded(&self) -> bool {
        self.first_failure.is_none()
            && self
                .states
                .values()
                .all(|state| *state == ExecState::Done)
    }

    pub fn completed_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == ExecState::Done)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == ExecState::Errored)
            .count()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Full execution trace of this submission
    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: SubmitterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend, BackendKind::ConcurrentPool);
        assert!(config.cache);
        assert!(config.concurrency.is_none());
    }

    #[test]
    fn config_roundtrip() {
        let json = r#"{"backend": "sequential", "concurrency": 2, "cache": false}"#;
        let config: SubmitterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.backend, BackendKind::Sequential);
        assert_eq!(config.concurrency, Some(2));
        assert!(!config.cache);

        let submitter = Submitter::from_config(config);
        assert_eq!(submitter.backend_name(), "sequential");
        assert!(!submitter.cache_enabled);
    }
}
