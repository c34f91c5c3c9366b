//! Execution backends.
//!
//! The runner only knows the [`ExecutionBackend`] trait. [`CommandBackend`] drives an
//! external notebook executor (`jupyter nbconvert --execute` by default) through a
//! pair of scratch files and merges the executed outputs back into the document.

use nb_core::{Document, Output};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Halt at the first failing cell and report a [`BackendFailure`].
    StopOnError,
    /// Keep executing after a failing cell; the failure is only visible as an
    /// error output on that cell.
    ContinueOnError,
}

impl ExecutionPolicy {
    pub fn from_allow_errors(allow_errors: bool) -> Self {
        if allow_errors {
            ExecutionPolicy::ContinueOnError
        } else {
            ExecutionPolicy::StopOnError
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendFailure {
    pub message: String,
}

impl BackendFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes every cell of a document, replacing code cell outputs in place.
///
/// Calls are synchronous and implementations need not support concurrent use.
pub trait ExecutionBackend {
    /// Short description of the backend for run metadata, if one can be obtained.
    fn descriptor(&self) -> Option<String> {
        None
    }

    fn execute(
        &mut self,
        document: &mut Document,
        policy: ExecutionPolicy,
    ) -> Result<(), BackendFailure>;
}

impl<B: ExecutionBackend + ?Sized> ExecutionBackend for Box<B> {
    fn descriptor(&self) -> Option<String> {
        (**self).descriptor()
    }

    fn execute(
        &mut self,
        document: &mut Document,
        policy: ExecutionPolicy,
    ) -> Result<(), BackendFailure> {
        (**self).execute(document, policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub program: String,
    pub args: Vec<String>,
    pub kernel: String,
    pub cell_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            program: "jupyter".to_string(),
            args: vec![
                "nbconvert".to_string(),
                "--to".to_string(),
                "notebook".to_string(),
                "--execute".to_string(),
            ],
            kernel: "python3".to_string(),
            cell_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    settings: BackendSettings,
}

const EXECUTED_NAME: &str = "executed.ipynb";

impl CommandBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    /// Leading positional arguments, e.g. `nbconvert` for `jupyter nbconvert ...`.
    fn subcommand(&self) -> impl Iterator<Item = &String> {
        self.settings.args.iter().take_while(|a| !a.starts_with('-'))
    }

    fn version_command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(self.subcommand())
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    /// The executor always continues past failing cells so that the error output is
    /// written; [`ExecutionPolicy::StopOnError`] is applied afterwards.
    fn command(&self, input: &Path, out_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .arg(format!(
                "--ExecutePreprocessor.timeout={}",
                self.settings.cell_timeout_secs
            ))
            .arg(format!(
                "--ExecutePreprocessor.kernel_name={}",
                self.settings.kernel
            ))
            .arg("--allow-errors")
            .arg("--output-dir")
            .arg(out_dir)
            .arg("--output")
            .arg(EXECUTED_NAME)
            .arg(input);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ExecutionBackend for CommandBackend {
    fn descriptor(&self) -> Option<String> {
        let output = self.version_command().output().ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)?;
        let mut label = self.settings.program.clone();
        for part in self.subcommand() {
            label.push(' ');
            label.push_str(part);
        }
        Some(format!("{} {}", label, version))
    }

    fn execute(
        &mut self,
        document: &mut Document,
        policy: ExecutionPolicy,
    ) -> Result<(), BackendFailure> {
        let scratch = tempfile::Builder::new()
            .prefix("nbrun_exec_")
            .tempdir()
            .map_err(|e| BackendFailure::new(format!("cannot create scratch dir: {}", e)))?;
        let input = scratch.path().join("input.ipynb");
        document
            .save(&input)
            .map_err(|e| BackendFailure::new(e.to_string()))?;

        let mut cmd = self.command(&input, scratch.path());
        debug!(program = %self.settings.program, ?policy, "spawning notebook executor");
        let output = cmd.output().map_err(|e| {
            BackendFailure::new(format!("failed to spawn {}: {}", self.settings.program, e))
        })?;

        let executed_path = scratch.path().join(EXECUTED_NAME);
        let mut halted = None;
        if executed_path.exists() {
            let executed =
                Document::load(&executed_path).map_err(|e| BackendFailure::new(e.to_string()))?;
            merge_outputs(document, executed);
            if policy == ExecutionPolicy::StopOnError {
                halted = halt_at_first_error(document);
            }
        }

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let message = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!("{} exited with status {}", self.settings.program, code)
                });
            return Err(BackendFailure::new(message));
        }
        match halted {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Drops everything executed after the first cell with an error output, leaving the
/// document as a halting executor would, and reports that error as the failure.
fn halt_at_first_error(document: &mut Document) -> Option<BackendFailure> {
    let (index, failure) = document.cells.iter().enumerate().find_map(|(i, cell)| {
        cell.outputs().iter().find_map(|output| match output {
            Output::Error(e) => Some((i, BackendFailure::new(format!("{}: {}", e.name, e.message)))),
            _ => None,
        })
    })?;
    for cell in document
        .cells
        .iter_mut()
        .skip(index + 1)
        .filter(|c| c.is_executable())
    {
        cell.outputs = Some(Vec::new());
        cell.extra
            .insert("execution_count".to_string(), Value::Null);
    }
    Some(failure)
}

/// Copies outputs and execution counts from `executed` onto the matching code cells
/// of `document`. Cell sources and narrative cells are left alone.
fn merge_outputs(document: &mut Document, executed: Document) {
    for (cell, done) in document.cells.iter_mut().zip(executed.cells) {
        if !cell.is_executable() || !done.is_executable() {
            continue;
        }
        cell.outputs = Some(done.outputs.unwrap_or_default());
        if let Some(count) = done.extra.get("execution_count") {
            cell.extra
                .insert("execution_count".to_string(), count.clone());
        }
    }
}
