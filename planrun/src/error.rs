//! Fatal pre-run errors.
//!
//! Per-step failures never surface here: the loop retries or marks the step
//! failed. These variants stop a run before the first step executes and are
//! carried through `anyhow` so callers can `downcast_ref` them for exit codes.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("plan file {path} not found")]
    PlanNotFound { path: PathBuf },

    #[error("corrupt plan {path}: {reason}")]
    CorruptPlan { path: PathBuf, reason: String },

    #[error("provider {provider} is missing required capabilities: {}", missing.join(", "))]
    CapabilityUnavailable {
        provider: String,
        missing: Vec<String>,
    },

    #[error("missing required context files: {}", display_paths(missing))]
    MissingContext { missing: Vec<PathBuf> },
}

impl RunError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RunError::CorruptPlan {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
