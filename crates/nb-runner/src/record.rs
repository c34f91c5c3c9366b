use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

static RUN_ID_DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("run id pattern"));

/// Collapses every run of characters outside `[A-Za-z0-9._-]` into a single `-`.
pub fn sanitize_run_id(raw: &str) -> String {
    RUN_ID_DISALLOWED.replace_all(raw, "-").into_owned()
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait IdGenerator {
    fn generate(&self) -> String;
}

/// Twelve hex characters taken from a random v4 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub allow_errors: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend_descriptor: Option<String>,
    pub last_backend_failure: Option<String>,
    pub artifact_dir: PathBuf,
    pub source_digest: String,
    pub runner_version: String,
}

/// Accumulates run metadata while the retry loop is in progress.
#[derive(Debug)]
pub struct RunRecorder {
    record: RunRecord,
}

impl RunRecorder {
    pub fn start(
        run_id: String,
        max_retries: u32,
        allow_errors: bool,
        artifact_dir: PathBuf,
        source_digest: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record: RunRecord {
                run_id,
                attempts: 0,
                max_retries,
                allow_errors,
                started_at,
                finished_at: started_at,
                backend_descriptor: None,
                last_backend_failure: None,
                artifact_dir,
                source_digest,
                runner_version: format!("nbrun-{}", env!("CARGO_PKG_VERSION")),
            },
        }
    }

    pub fn backend_descriptor(&mut self, descriptor: Option<String>) {
        self.record.backend_descriptor = descriptor;
    }

    pub fn attempt_started(&mut self, attempt: u32) {
        self.record.attempts = attempt;
    }

    pub fn backend_failed(&mut self, message: String) {
        self.record.last_backend_failure = Some(message);
    }

    pub fn finish(mut self, finished_at: DateTime<Utc>) -> RunRecord {
        self.record.finished_at = finished_at;
        self.record
    }
}
