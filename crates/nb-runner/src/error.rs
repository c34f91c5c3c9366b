use nb_core::DocumentError;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions that abort an action. Backend failures and cell errors are not here:
/// they are recorded in the run result and never stop the retry loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("load failure: {0}")]
    Load(#[source] DocumentError),
    #[error("write failure: {0}")]
    Persist(#[source] DocumentError),
    #[error("write failure: {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("missing required argument --{0}")]
    MissingArgument(&'static str),
}
