mod backend;
mod collect;
mod error;
mod prepare;
mod record;
mod rewrite;

pub use backend::{BackendFailure, BackendSettings, CommandBackend, ExecutionBackend, ExecutionPolicy};
pub use collect::{
    artifact_file_name, collect_outputs, Artifact, ArtifactDir, AttemptOutputs, CellErrorRecord,
};
pub use error::RunError;
pub use prepare::{prepare_document, prepare_from_bytes};
pub use record::{
    sanitize_run_id, Clock, IdGenerator, RandomIdGenerator, RunRecord, RunRecorder, SystemClock,
};
pub use rewrite::{rewrite_literal, rewrite_source};

use nb_core::{load_plan, sha256_bytes, CellPreview, Document};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub workspace_root: Option<PathBuf>,
    pub allow_errors: bool,
    pub max_retries: i64,
    pub run_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            allow_errors: false,
            max_retries: 1,
            run_id: None,
        }
    }
}

impl RunConfig {
    /// Attempt budget, clamped up to 1.
    pub fn retry_budget(&self) -> u32 {
        self.max_retries.clamp(1, i64::from(u32::MAX)) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    #[serde(rename = "ok")]
    Success,
    #[serde(rename = "exhausted")]
    ExhaustedRetries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub output: PathBuf,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<CellErrorRecord>,
    pub metadata: RunRecord,
}

impl RunResult {
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.outcome,
            "action": Action::Run.as_str(),
            "output": self.output.display().to_string(),
            "artifacts": self.artifacts,
            "errors": self.errors,
            "metadata": self.metadata,
        })
    }
}

/// Runs notebooks against one backend. Attempts are strictly sequential; use one
/// `Runner` per concurrent run.
pub struct Runner<B: ExecutionBackend> {
    backend: B,
    clock: Box<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl<B: ExecutionBackend> Runner<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            clock: Box::new(SystemClock),
            ids: Box::new(RandomIdGenerator),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Executes `source` until it runs without error outputs or the retry budget is
    /// spent, writing the executed notebook to `output` after every attempt.
    ///
    /// `source` is read once; every attempt starts again from those bytes, so a run
    /// whose `output` is `source` never sees an earlier attempt's outputs. Backend
    /// failures are recorded in the result; only load and write failures abort the run.
    pub fn run(
        &mut self,
        source: &Path,
        output: &Path,
        config: &RunConfig,
    ) -> Result<RunResult, RunError> {
        let run_id = match config.run_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => sanitize_run_id(id),
            None => sanitize_run_id(&self.ids.generate()),
        };
        let max_retries = config.retry_budget();
        let policy = ExecutionPolicy::from_allow_errors(config.allow_errors);
        let workspace_root = config.workspace_root.as_deref();

        let source_bytes = fs::read(source).map_err(|e| {
            RunError::Load(nb_core::DocumentError::Read {
                path: source.to_path_buf(),
                source: e,
            })
        })?;
        let artifact_dir = ArtifactDir::acquire(output, &run_id)?;
        let mut recorder = RunRecorder::start(
            run_id.clone(),
            max_retries,
            config.allow_errors,
            artifact_dir.path().to_path_buf(),
            sha256_bytes(&source_bytes),
            self.clock.now(),
        );
        recorder.backend_descriptor(self.backend.descriptor());
        info!(run_id = %run_id, source = %source.display(), max_retries, "notebook run started");

        let mut attempt: u32 = 0;
        let (outcome, collected) = loop {
            attempt += 1;
            recorder.attempt_started(attempt);
            let mut document = prepare_from_bytes(source, &source_bytes, workspace_root)?;
            if let Err(failure) = self.backend.execute(&mut document, policy) {
                warn!(run_id = %run_id, attempt, error = %failure, "backend reported failure");
                recorder.backend_failed(failure.message);
            }
            document.save(output).map_err(RunError::Persist)?;
            let collected = collect_outputs(&document, &artifact_dir, attempt)?;
            debug!(
                run_id = %run_id,
                attempt,
                errors = collected.errors.len(),
                artifacts = collected.artifacts.len(),
                "attempt finished"
            );
            if config.allow_errors || collected.errors.is_empty() {
                break (RunOutcome::Success, collected);
            }
            if attempt >= max_retries {
                break (RunOutcome::ExhaustedRetries, collected);
            }
        };

        let metadata = recorder.finish(self.clock.now());
        info!(
            run_id = %run_id,
            attempts = metadata.attempts,
            outcome = ?outcome,
            "notebook run finished"
        );
        Ok(RunResult {
            outcome,
            output: output.to_path_buf(),
            artifacts: collected.artifacts,
            errors: collected.errors,
            metadata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Run,
    Summarize,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Run => "run",
            Action::Summarize => "summarize",
        }
    }
}

impl FromStr for Action {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "run" => Ok(Action::Run),
            "summarize" => Ok(Action::Summarize),
            other => Err(RunError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionRequest {
    pub plan: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub config: RunConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStatus {
    Ok,
    Exhausted,
    Error,
}

impl ManifestStatus {
    /// Process exit code reported for a finished action.
    pub fn exit_code(self) -> i32 {
        match self {
            ManifestStatus::Ok => 0,
            ManifestStatus::Error => 1,
            ManifestStatus::Exhausted => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Created { path: PathBuf },
    Ran(RunResult),
    Summarized(Vec<CellPreview>),
    Failed { message: String },
}

impl ActionOutcome {
    pub fn status(&self) -> ManifestStatus {
        match self {
            ActionOutcome::Ran(result) if result.outcome == RunOutcome::ExhaustedRetries => {
                ManifestStatus::Exhausted
            }
            ActionOutcome::Failed { .. } => ManifestStatus::Error,
            _ => ManifestStatus::Ok,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ActionOutcome::Created { path } => json!({
                "status": "ok",
                "action": Action::Create.as_str(),
                "path": path.display().to_string(),
            }),
            ActionOutcome::Ran(result) => result.to_json(),
            ActionOutcome::Summarized(summary) => json!({
                "status": "ok",
                "action": Action::Summarize.as_str(),
                "summary": summary,
            }),
            ActionOutcome::Failed { message } => json!({
                "status": "error",
                "message": message,
            }),
        }
    }
}

fn required<'a>(value: &'a Option<PathBuf>, flag: &'static str) -> Result<&'a Path, RunError> {
    value.as_deref().ok_or(RunError::MissingArgument(flag))
}

fn create_notebook(plan: &Path, output: &Path) -> Result<PathBuf, RunError> {
    let sections = load_plan(plan).map_err(RunError::Load)?;
    Document::from_plan(&sections)
        .save(output)
        .map_err(RunError::Persist)?;
    Ok(output.to_path_buf())
}

fn try_dispatch<B: ExecutionBackend>(
    runner: &mut Runner<B>,
    action: &str,
    request: &ActionRequest,
) -> Result<ActionOutcome, RunError> {
    match action.parse::<Action>()? {
        Action::Create => {
            let plan = required(&request.plan, "plan")?;
            let output = required(&request.output, "output")?;
            create_notebook(plan, output).map(|path| ActionOutcome::Created { path })
        }
        Action::Run => {
            let input = required(&request.input, "input")?;
            let output = required(&request.output, "output")?;
            runner
                .run(input, output, &request.config)
                .map(ActionOutcome::Ran)
        }
        Action::Summarize => {
            let input = required(&request.input, "input")?;
            let document = Document::load(input).map_err(RunError::Load)?;
            Ok(ActionOutcome::Summarized(document.summarize()))
        }
    }
}

/// Performs `action`, converting every fatal error into [`ActionOutcome::Failed`].
pub fn dispatch<B: ExecutionBackend>(
    runner: &mut Runner<B>,
    action: &str,
    request: &ActionRequest,
) -> ActionOutcome {
    match try_dispatch(runner, action, request) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(action, error = %err, "action failed");
            ActionOutcome::Failed {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_clamps_up_to_one() {
        let mut config = RunConfig::default();
        assert_eq!(config.retry_budget(), 1);
        config.max_retries = 0;
        assert_eq!(config.retry_budget(), 1);
        config.max_retries = -7;
        assert_eq!(config.retry_budget(), 1);
        config.max_retries = 4;
        assert_eq!(config.retry_budget(), 4);
    }

    #[test]
    fn action_parsing_rejects_unknown_names() {
        assert_eq!("run".parse::<Action>().unwrap(), Action::Run);
        assert_eq!("create".parse::<Action>().unwrap(), Action::Create);
        assert_eq!("summarize".parse::<Action>().unwrap(), Action::Summarize);
        let err = "explode".parse::<Action>().expect_err("unknown");
        assert!(matches!(err, RunError::UnknownAction(ref a) if a == "explode"));
    }

    #[test]
    fn exit_codes_distinguish_failure_from_exhaustion() {
        assert_eq!(ManifestStatus::Ok.exit_code(), 0);
        assert_eq!(ManifestStatus::Error.exit_code(), 1);
        assert_eq!(ManifestStatus::Exhausted.exit_code(), 2);
    }

    #[test]
    fn failed_outcome_serializes_uniformly() {
        let failed = ActionOutcome::Failed {
            message: "unknown action: explode".to_string(),
        };
        assert_eq!(failed.status(), ManifestStatus::Error);
        assert_eq!(
            failed.to_json(),
            json!({"status": "error", "message": "unknown action: explode"})
        );
    }
}
