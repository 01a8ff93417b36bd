//! Stable exit codes for planrun CLI commands.

use crate::looping::LoopStop;

/// Run complete, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid input or a pre-run failure (config, plan, capabilities, context).
pub const INVALID: i32 = 1;
/// `planrun run` stopped at the iteration limit with work remaining.
pub const ITERATION_LIMIT: i32 = 2;
/// A step permanently failed.
pub const STEP_FAILED: i32 = 3;

/// Exit code for a finished loop.
pub fn for_stop(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Complete { failed_steps } if failed_steps.is_empty() => OK,
        LoopStop::Complete { .. } | LoopStop::StepFailed { .. } => STEP_FAILED,
        LoopStop::IterationLimit { .. } => ITERATION_LIMIT,
        LoopStop::DryRun { .. } => OK,
    }
}
