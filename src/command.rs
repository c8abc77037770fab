//! External-process task bodies
//!
//! A [`CommandTemplate`] is a declarative argv skeleton: literal fragments
//! interleaved with slot placeholders that are filled from the resolved
//! inputs at dispatch time. The materialized argv is fully inspectable
//! before anything runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::SpindleError;
use crate::task::{SlotDef, TaskInputs, TaskOutputs, ValueKind};

/// Default timeout for external commands (60 seconds)
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// One argv fragment
#[derive(Debug, Clone)]
pub enum ArgTemplate {
    /// Fixed string, passed through verbatim
    Literal(String),
    /// Replaced by the value bound to this input slot
    Slot(Arc<str>),
}

/// Declarative command line: program, argv skeleton, environment,
/// working directory, timeout
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<ArgTemplate>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandTemplate {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Append a literal argument
    pub fn arg(mut self, literal: &str) -> Self {
        self.args.push(ArgTemplate::Literal(literal.to_string()));
        self
    }

    /// Append an argument filled from an input slot at dispatch time
    pub fn arg_slot(mut self, slot: &str) -> Self {
        self.args.push(ArgTemplate::Slot(slot.into()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Output slots every command task produces when none are declared:
    /// trimmed stdout, exit status, and the working directory the process
    /// actually ran in
    pub fn default_outputs() -> Vec<SlotDef> {
        vec![
            SlotDef::new("stdout", ValueKind::Str),
            SlotDef::new("status", ValueKind::Int),
            SlotDef::new("cwd", ValueKind::Str),
        ]
    }

    /// Materialize the full argv (program first) against resolved inputs
    /// without running anything. Deterministic: equal inputs produce an
    /// equal argv.
    pub fn preview(&self, inputs: &TaskInputs) -> Result<Vec<String>, SpindleError> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        for arg in &self.args {
            match arg {
                ArgTemplate::Literal(s) => argv.push(s.clone()),
                ArgTemplate::Slot(slot) => {
                    let value =
                        inputs
                            .get(slot.as_ref())
                            .ok_or_else(|| SpindleError::UnresolvedInput {
                                task: Arc::from(self.program.as_str()),
                                slot: Arc::clone(slot),
                            })?;
                    argv.push(argv_fragment(value));
                }
            }
        }
        Ok(argv)
    }

    /// Run the command against resolved inputs.
    ///
    /// Errors are returned as plain strings so a command body fails the
    /// same way a function body does; the scheduler wraps them with the
    /// task's identity.
    pub async fn run(&self, inputs: &TaskInputs) -> Result<TaskOutputs, String> {
        let argv = self.preview(inputs).map_err(|e| e.to_string())?;
        debug!(program = %self.program, args = argv.len() - 1, "spawning command");

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| format!("command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("failed to spawn '{}': {}", self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        // Record where the process actually ran; relative output paths
        // only make sense against this directory
        let ran_in = match &self.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };

        let mut outputs = TaskOutputs::new();
        outputs.insert(
            "stdout".to_string(),
            json!(String::from_utf8_lossy(&output.stdout).trim()),
        );
        outputs.insert(
            "status".to_string(),
            json!(output.status.code().unwrap_or(-1)),
        );
        outputs.insert("cwd".to_string(), json!(ran_in.display().to_string()));
        Ok(outputs)
    }
}

/// Render one bound value as an argv fragment: strings pass through
/// verbatim, everything else is compact JSON
fn argv_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
