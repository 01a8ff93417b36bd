//! Deterministic step selection.

use crate::plan::{Plan, Step, StepStatus};

/// Where the plan stands when the loop looks for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// Next step to execute, with its index in plan order.
    Next(usize, &'a Step),
    /// Every step is done.
    Complete,
    /// Nothing is eligible, but at least one step is permanently failed.
    Exhausted,
}

/// True if the step may be picked by the loop.
pub fn is_eligible(step: &Step) -> bool {
    match step.status {
        StepStatus::Pending => true,
        StepStatus::Failed => step.attempts_remaining(),
        StepStatus::InProgress | StepStatus::Done => false,
    }
}

/// Pick the first step in plan order that is pending or failed with attempts remaining.
pub fn next_step(plan: &Plan) -> Selection<'_> {
    if let Some((idx, step)) = plan
        .steps
        .iter()
        .enumerate()
        .find(|(_, step)| is_eligible(step))
    {
        return Selection::Next(idx, step);
    }
    if plan.steps.iter().any(Step::is_exhausted) {
        Selection::Exhausted
    } else {
        Selection::Complete
    }
}

/// Every step eligible for execution, in plan order.
pub fn eligible_steps(plan: &Plan) -> impl Iterator<Item = &Step> {
    plan.steps.iter().filter(|step| is_eligible(step))
}
