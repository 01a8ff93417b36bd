//! Shared deterministic types for planrun core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Why a step attempt failed.
///
/// All three kinds are retryable; they are kept distinct so run logs can tell
/// infrastructure flakiness (timeouts) apart from logic errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider process exited nonzero (or could not be run).
    ProcessFailure,
    /// The provider process or its event stream exceeded its time budget.
    Timeout,
    /// The provider succeeded but a post-check command failed.
    PostCheckFailure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ProcessFailure => "process_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::PostCheckFailure => "post_check_failure",
        }
    }
}

/// Classified failure of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub detail: String,
}

/// Outcome of one attempt at a step, as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(StepFailure),
}

/// Result of a single post-check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCheckResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Tail of combined stdout/stderr, already truncated.
    pub output: String,
}

impl PostCheckResult {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Snapshot of the git working tree used by the auto-commit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeState {
    /// The status query failed (not a repository, git missing, ...).
    Unavailable { error: String },
    Available { dirty: bool },
}
