//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::plan::{Plan, StepStatus};

/// Check semantic invariants not expressible in JSON Schema:
/// - No duplicate or empty step ids
/// - `maxAttempts > 0`
/// - `attempts <= maxAttempts`
/// - At most one step `in_progress`
pub fn validate_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut in_progress = Vec::new();

    for (idx, step) in plan.steps.iter().enumerate() {
        let label = if step.id.is_empty() {
            format!("steps[{idx}]")
        } else {
            step.id.clone()
        };
        if step.id.trim().is_empty() {
            errors.push(format!("{label}: id must not be empty"));
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        if step.max_attempts == 0 {
            errors.push(format!("{label}: maxAttempts must be > 0"));
        }
        if step.attempts > step.max_attempts {
            errors.push(format!(
                "{label}: attempts {} exceeds maxAttempts {}",
                step.attempts, step.max_attempts
            ));
        }
        if step.status == StepStatus::InProgress {
            in_progress.push(label);
        }
    }

    if in_progress.len() > 1 {
        errors.push(format!(
            "more than one step in_progress: {}",
            in_progress.join(", ")
        ));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_steps, step};

    #[test]
    fn valid_plan_has_no_errors() {
        let plan = plan_with_steps(vec![step("a"), step("b")]);
        assert!(validate_invariants(&plan).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let mut dup = step("a");
        dup.attempts = 4;
        dup.max_attempts = 3;
        dup.status = StepStatus::InProgress;
        let mut zero = step("b");
        zero.max_attempts = 0;
        zero.status = StepStatus::InProgress;
        let plan = plan_with_steps(vec![step("a"), dup, zero]);

        let errors = validate_invariants(&plan);
        assert!(errors.iter().any(|err| err.contains("duplicate step id 'a'")));
        assert!(errors.iter().any(|err| err.contains("exceeds maxAttempts")));
        assert!(errors.iter().any(|err| err.contains("maxAttempts must be > 0")));
        assert!(errors.iter().any(|err| err.contains("more than one step in_progress")));
    }
}
