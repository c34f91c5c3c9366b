use anyhow::{anyhow, Result};
use nb_runner::{BackendSettings, RunConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_RETRIES_ENV: &str = "NBRUN_MAX_RETRIES";

/// Optional settings file (YAML or JSON). Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub workspace_root: Option<PathBuf>,
    pub allow_errors: Option<bool>,
    pub max_retries: Option<i64>,
    pub run_id: Option<String>,
    pub backend: Option<BackendSettings>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read config {}: {}", path.display(), e))?;
    if raw.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&raw).map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Default)]
pub struct FlagOverrides {
    pub workspace_root: Option<PathBuf>,
    pub allow_errors: bool,
    pub max_retries: Option<i64>,
    pub run_id: Option<String>,
}

pub fn env_max_retries(raw: Option<String>) -> Result<Option<i64>> {
    match raw {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => v
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer, got '{}'", MAX_RETRIES_ENV, v)),
    }
}

/// Flags win over the file, the file wins over the environment.
pub fn resolve_run_config(
    file: &FileConfig,
    env_max_retries: Option<i64>,
    flags: FlagOverrides,
) -> RunConfig {
    let defaults = RunConfig::default();
    RunConfig {
        workspace_root: flags.workspace_root.or_else(|| file.workspace_root.clone()),
        allow_errors: flags.allow_errors || file.allow_errors.unwrap_or(defaults.allow_errors),
        max_retries: flags
            .max_retries
            .or(file.max_retries)
            .or(env_max_retries)
            .unwrap_or(defaults.max_retries),
        run_id: flags.run_id.or_else(|| file.run_id.clone()),
    }
}
