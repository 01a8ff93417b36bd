//! Prompt rendering for one step attempt.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::plan::{RiskLevel, Step, StepType};

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");

/// Failure detail is clipped to its tail so a noisy log cannot crowd out
/// the step itself.
const FAILURE_TAIL_BYTES: usize = 4_000;

/// Step fields exposed to the template.
#[derive(Debug, Clone, Serialize)]
struct StepContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    success_criteria: &'a str,
    kind: &'static str,
    risk_level: &'static str,
    max_attempts: u32,
    files: &'a [String],
    post_checks: &'a [String],
    rollback_hint: &'a str,
}

impl<'a> StepContext<'a> {
    fn from_step(step: &'a Step) -> Self {
        Self {
            id: &step.id,
            title: step.title.trim(),
            description: step.description.trim(),
            success_criteria: step.success_criteria.trim(),
            kind: step_type_name(step.kind),
            risk_level: risk_name(step.risk_level),
            max_attempts: step.max_attempts,
            files: &step.files,
            post_checks: &step.post_checks,
            rollback_hint: step.rollback_hint.trim(),
        }
    }
}

/// Everything that varies between prompts.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub goal: &'a str,
    pub step: &'a Step,
    /// 1-based number of the attempt being started.
    pub attempt: u32,
    /// Why the previous attempt at this step failed.
    pub previous_failure: Option<&'a str>,
    /// The provider is constrained to the step-report schema.
    pub structured_output: bool,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("step", STEP_TEMPLATE)
            .context("parse step prompt template")?;
        Ok(Self { env })
    }

    pub fn render_step(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("step")?;
        let failure = input
            .previous_failure
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| crate::provider::tail(s, FAILURE_TAIL_BYTES));
        let rendered = template
            .render(context! {
                goal => input.goal.trim(),
                step => StepContext::from_step(input.step),
                attempt => input.attempt,
                failure => failure,
                structured_output => input.structured_output,
            })
            .with_context(|| format!("render prompt for step {}", input.step.id))?;
        Ok(rendered.trim().to_string())
    }
}

fn step_type_name(kind: StepType) -> &'static str {
    match kind {
        StepType::Code => "code",
        StepType::Docs => "docs",
        StepType::Test => "test",
        StepType::Governance => "governance",
        StepType::Ops => "ops",
        StepType::Mixed => "mixed",
    }
}

fn risk_name(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rich_step() -> Step {
        let mut step = Step::new("step-02", "Add retry backoff");
        step.description = "Wrap the HTTP client in exponential backoff.".to_string();
        step.success_criteria = "Transient 503s are retried".to_string();
        step.files = vec!["src/http.rs".to_string()];
        step.post_checks = vec!["cargo test -p http".to_string()];
        step.rollback_hint = "git checkout src/http.rs".to_string();
        step.risk_level = RiskLevel::High;
        step
    }

    fn render(input: &PromptInputs<'_>) -> String {
        PromptEngine::new().expect("engine").render_step(input).expect("render")
    }

    /// Sections appear in a fixed order: goal, step, files, checks, rollback,
    /// failure, rules.
    #[test]
    fn sections_render_in_order() {
        let step = rich_step();
        let content = render(&PromptInputs {
            goal: "Harden the client",
            step: &step,
            attempt: 2,
            previous_failure: Some("post-check `cargo test -p http` exited 101"),
            structured_output: true,
        });

        let positions: Vec<usize> = [
            "### Goal",
            "### Current Step (step-02, attempt 2 of 3)",
            "Success criteria: Transient 503s are retried",
            "### Files In Scope",
            "- `cargo test -p http`",
            "### Rollback",
            "### Previous Attempt Failed",
            "### Rules",
            "JSON report",
        ]
        .iter()
        .map(|needle| content.find(needle).unwrap_or_else(|| panic!("missing {needle}\n{content}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{content}");
        assert!(content.contains("Risk: high"));
    }

    #[test]
    fn optional_sections_are_omitted() {
        let step = Step::new("step-01", "Write README");
        let content = render(&PromptInputs {
            goal: "Docs",
            step: &step,
            attempt: 1,
            previous_failure: Some("   "),
            structured_output: false,
        });
        assert!(!content.contains("### Files In Scope"));
        assert!(!content.contains("### Checks Run"));
        assert!(!content.contains("### Rollback"));
        assert!(!content.contains("### Previous Attempt Failed"));
        assert!(!content.contains("JSON report"));
        // Description equal to the title is not repeated.
        assert_eq!(content.matches("Write README").count(), 1);
    }
}
