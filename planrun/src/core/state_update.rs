//! Loop-owned state transitions for plan steps.
//!
//! `status`, `attempts` and the session bookkeeping in metadata are owned by
//! the loop; these helpers are the only places that change them.

use crate::core::types::{AttemptOutcome, StepFailure};
use crate::plan::{Plan, StepStatus};

/// What happened to a step after an attempt was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The step is done.
    Completed,
    /// The attempt failed and the step was requeued as pending.
    Requeued { attempts: u32, max_attempts: u32 },
    /// The attempt failed and no attempts remain.
    Exhausted { attempts: u32, max_attempts: u32 },
}

/// Reset every `in_progress` step to `pending`.
///
/// A step is only ever `in_progress` while the loop is inside its turn, so
/// finding one at startup means the previous process died mid-step. Returns
/// the ids that were reset, in plan order.
pub fn recover_in_progress(plan: &mut Plan) -> Vec<String> {
    let mut reset = Vec::new();
    for step in &mut plan.steps {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Pending;
            reset.push(step.id.clone());
        }
    }
    reset
}

/// Mark `step_id` as the single in-flight step.
pub fn begin_attempt(plan: &mut Plan, step_id: &str) -> Result<(), String> {
    if let Some(other) = plan
        .steps
        .iter()
        .find(|step| step.status == StepStatus::InProgress && step.id != step_id)
    {
        return Err(format!("step '{}' is already in_progress", other.id));
    }
    let step = plan
        .step_mut(step_id)
        .ok_or_else(|| format!("step '{step_id}' not found"))?;
    if !step.attempts_remaining() {
        return Err(format!(
            "step '{step_id}' has no attempts left ({}/{})",
            step.attempts, step.max_attempts
        ));
    }
    step.status = StepStatus::InProgress;
    Ok(())
}

/// Apply the outcome of an attempt to `step_id`.
///
/// Success marks the step done and releases its session. Failure increments
/// `attempts` (saturating at `maxAttempts`) and either requeues the step or
/// marks it failed; an exhausted step also releases its session.
pub fn apply_outcome(
    plan: &mut Plan,
    step_id: &str,
    outcome: &AttemptOutcome,
) -> Result<Transition, String> {
    let step = plan
        .step_mut(step_id)
        .ok_or_else(|| format!("step '{step_id}' not found"))?;
    if step.status != StepStatus::InProgress {
        return Err(format!(
            "step '{step_id}' is {} (expected in_progress)",
            step.status.as_str()
        ));
    }

    let transition = match outcome {
        AttemptOutcome::Succeeded => {
            step.status = StepStatus::Done;
            Transition::Completed
        }
        AttemptOutcome::Failed(StepFailure { .. }) => {
            if step.attempts < step.max_attempts {
                step.attempts += 1;
            }
            if step.attempts_remaining() {
                step.status = StepStatus::Pending;
                Transition::Requeued {
                    attempts: step.attempts,
                    max_attempts: step.max_attempts,
                }
            } else {
                step.status = StepStatus::Failed;
                Transition::Exhausted {
                    attempts: step.attempts,
                    max_attempts: step.max_attempts,
                }
            }
        }
    };

    if !matches!(transition, Transition::Requeued { .. })
        && plan.metadata.resume_step_id.as_deref() == Some(step_id)
    {
        plan.clear_session();
    }
    Ok(transition)
}

/// Remember the session returned by the provider for a retry of `step_id`.
pub fn record_session(plan: &mut Plan, step_id: &str, session_id: Option<&str>) {
    if let Some(session) = session_id.filter(|s| !s.is_empty()) {
        plan.metadata.resume_session_id = Some(session.to_string());
        plan.metadata.resume_step_id = Some(step_id.to_string());
    }
}

/// Count one loop iteration, whatever its outcome.
pub fn complete_iteration(plan: &mut Plan) -> u32 {
    plan.metadata.completed_iterations = plan.metadata.completed_iterations.saturating_add(1);
    plan.metadata.completed_iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::test_support::{plan_with_steps, step, step_with};

    fn failure() -> AttemptOutcome {
        AttemptOutcome::Failed(StepFailure {
            kind: FailureKind::ProcessFailure,
            detail: "exit 1".to_string(),
        })
    }

    #[test]
    fn recovery_resets_in_progress_only() {
        let mut plan = plan_with_steps(vec![
            step_with("a", StepStatus::Done, 0, 3),
            step_with("b", StepStatus::InProgress, 1, 3),
            step("c"),
        ]);
        let reset = recover_in_progress(&mut plan);
        assert_eq!(reset, vec!["b".to_string()]);
        assert_eq!(plan.steps[0].status, StepStatus::Done);
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
        assert_eq!(plan.steps[1].attempts, 1);
    }

    #[test]
    fn begin_attempt_refuses_second_in_progress() {
        let mut plan = plan_with_steps(vec![step_with("a", StepStatus::InProgress, 0, 3), step("b")]);
        let err = begin_attempt(&mut plan, "b").expect_err("second in_progress");
        assert!(err.contains("already in_progress"));
    }

    #[test]
    fn begin_attempt_refuses_exhausted_step() {
        let mut plan = plan_with_steps(vec![step_with("a", StepStatus::Failed, 2, 2)]);
        assert!(begin_attempt(&mut plan, "a").is_err());
    }

    #[test]
    fn success_marks_done_and_releases_session() {
        let mut plan = plan_with_steps(vec![step("a")]);
        begin_attempt(&mut plan, "a").expect("begin");
        record_session(&mut plan, "a", Some("sess-1"));

        let transition = apply_outcome(&mut plan, "a", &AttemptOutcome::Succeeded).expect("apply");
        assert_eq!(transition, Transition::Completed);
        assert_eq!(plan.steps[0].status, StepStatus::Done);
        assert_eq!(plan.steps[0].attempts, 0);
        assert_eq!(plan.metadata.resume_session_id, None);
    }

    #[test]
    fn failure_requeues_then_exhausts() {
        let mut plan = plan_with_steps(vec![step_with("a", StepStatus::Pending, 0, 2)]);

        begin_attempt(&mut plan, "a").expect("begin");
        record_session(&mut plan, "a", Some("sess-1"));
        let first = apply_outcome(&mut plan, "a", &failure()).expect("apply");
        assert_eq!(
            first,
            Transition::Requeued {
                attempts: 1,
                max_attempts: 2
            }
        );
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert_eq!(plan.session_for("a"), Some("sess-1"));

        begin_attempt(&mut plan, "a").expect("begin");
        let second = apply_outcome(&mut plan, "a", &failure()).expect("apply");
        assert_eq!(
            second,
            Transition::Exhausted {
                attempts: 2,
                max_attempts: 2
            }
        );
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
        assert!(plan.steps[0].attempts <= plan.steps[0].max_attempts);
        assert_eq!(plan.session_for("a"), None);
    }

    #[test]
    fn apply_requires_in_progress() {
        let mut plan = plan_with_steps(vec![step("a")]);
        let err = apply_outcome(&mut plan, "a", &AttemptOutcome::Succeeded).expect_err("pending");
        assert!(err.contains("expected in_progress"));
    }

    #[test]
    fn other_steps_session_survives_completion() {
        let mut plan = plan_with_steps(vec![step("a"), step("b")]);
        record_session(&mut plan, "b", Some("sess-b"));
        begin_attempt(&mut plan, "a").expect("begin");
        apply_outcome(&mut plan, "a", &AttemptOutcome::Succeeded).expect("apply");
        assert_eq!(plan.session_for("b"), Some("sess-b"));
    }

    #[test]
    fn iterations_count_up() {
        let mut plan = plan_with_steps(vec![step("a")]);
        assert_eq!(complete_iteration(&mut plan), 1);
        assert_eq!(complete_iteration(&mut plan), 2);
    }
}
