mod config;

use anyhow::Result;
use clap::Parser;
use config::{env_max_retries, load_file_config, resolve_run_config, FileConfig, FlagOverrides};
use nb_runner::{dispatch, ActionOutcome, ActionRequest, CommandBackend, Runner};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "NBRUN_LOG";

#[derive(Parser)]
#[command(name = "nbrun", version, about = "Execute notebooks with retries and artifact capture")]
struct Cli {
    /// create | run | summarize
    action: String,
    #[arg(long)]
    plan: Option<PathBuf>,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    workspace_root: Option<PathBuf>,
    #[arg(long)]
    allow_errors: bool,
    #[arg(long, allow_negative_numbers = true)]
    max_retries: Option<i64>,
    #[arg(long)]
    run_id: Option<String>,
    /// YAML or JSON settings file; flags take precedence over it.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let outcome = match execute(cli) {
        Ok(outcome) => outcome,
        Err(err) => ActionOutcome::Failed {
            message: err.to_string(),
        },
    };
    emit_json(&outcome.to_json());
    std::process::exit(outcome.status().exit_code());
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

fn execute(cli: Cli) -> Result<ActionOutcome> {
    tracing::debug!(action = %cli.action, config = ?cli.config, "dispatching");
    let file = match &cli.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    let env_retries = env_max_retries(std::env::var(config::MAX_RETRIES_ENV).ok())?;
    let run_config = resolve_run_config(
        &file,
        env_retries,
        FlagOverrides {
            workspace_root: cli.workspace_root,
            allow_errors: cli.allow_errors,
            max_retries: cli.max_retries,
            run_id: cli.run_id,
        },
    );
    let request = ActionRequest {
        plan: cli.plan,
        input: cli.input,
        output: cli.output,
        config: run_config,
    };
    let backend = CommandBackend::new(file.backend.unwrap_or_default());
    let mut runner = Runner::new(backend);
    Ok(dispatch(&mut runner, &cli.action, &request))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"status\":\"error\",\"message\":\"failed to serialize result\"}}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_flag_surface() {
        let cli = Cli::try_parse_from([
            "nbrun",
            "run",
            "--input",
            "in.ipynb",
            "--output",
            "out.ipynb",
            "--workspace-root",
            "/ws",
            "--allow-errors",
            "--max-retries",
            "-1",
            "--run-id",
            "abc",
        ])
        .expect("parse");
        assert_eq!(cli.action, "run");
        assert_eq!(cli.input, Some(PathBuf::from("in.ipynb")));
        assert!(cli.allow_errors);
        assert_eq!(cli.max_retries, Some(-1));
        assert_eq!(cli.run_id.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_action_reaches_dispatch_as_error_result() {
        let cli = Cli::try_parse_from(["nbrun", "explode"]).expect("any action string parses");
        let outcome = execute(cli).expect("execute");
        assert_eq!(outcome.status().exit_code(), 1);
        assert_eq!(outcome.to_json()["status"], "error");
    }
}
