//! Conversion of an unstructured step list into a fully defaulted [`Plan`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::plan::{
    CURRENT_SCHEMA_VERSION, DEFAULT_MAX_ATTEMPTS, DEFAULT_OWNER, Plan, RiskLevel, RunMetadata,
    Step, StepStatus, StepType,
};

/// Caller-provided fields that a draft never carries.
#[derive(Debug, Clone)]
pub struct DraftContext {
    pub goal: String,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Build a plan from a raw goal decomposition.
///
/// `raw` is either an array of steps or an object with a `steps` array (and an
/// optional `goal` that wins over `ctx.goal` when the latter is empty). Steps
/// may be plain strings (used as the title) or objects with any subset of the
/// step fields, in camelCase or snake_case.
pub fn normalize_draft(ctx: &DraftContext, raw: &Value) -> Result<Plan, String> {
    let (draft_goal, items) = match raw {
        Value::Array(items) => (None, items.as_slice()),
        Value::Object(map) => {
            let items = map
                .get("steps")
                .and_then(Value::as_array)
                .ok_or_else(|| "draft object must contain a steps array".to_string())?;
            (map.get("goal").and_then(Value::as_str), items.as_slice())
        }
        _ => return Err("draft must be an array of steps or an object with steps".to_string()),
    };

    let mut steps = items
        .iter()
        .enumerate()
        .map(|(idx, item)| normalize_step(idx, item))
        .collect::<Result<Vec<_>, _>>()?;
    assign_generated_ids(&mut steps);

    let goal = if ctx.goal.trim().is_empty() {
        draft_goal.unwrap_or_default().trim().to_string()
    } else {
        ctx.goal.trim().to_string()
    };

    let mut plan = Plan {
        schema_version: CURRENT_SCHEMA_VERSION,
        goal,
        created_at: ctx.created_at,
        steps,
        metadata: RunMetadata {
            provider: ctx.provider.clone(),
            model: ctx.model.clone(),
            total_iterations: 0,
            completed_iterations: 0,
            resume_session_id: None,
            resume_step_id: None,
        },
    };
    plan.metadata.total_iterations = plan.attempt_budget();
    Ok(plan)
}

/// Default id for the step at zero-based `idx`.
pub fn default_step_id(idx: usize) -> String {
    format!("step-{:02}", idx + 1)
}

/// Give every step without an explicit id the positional `step-NN`, moving on
/// to the next free number when an explicit id already claims it.
fn assign_generated_ids(steps: &mut [Step]) {
    let mut taken: HashSet<String> = steps
        .iter()
        .filter(|step| !step.id.is_empty())
        .map(|step| step.id.clone())
        .collect();
    for (idx, step) in steps.iter_mut().enumerate() {
        if !step.id.is_empty() {
            continue;
        }
        let mut n = idx;
        while !taken.insert(default_step_id(n)) {
            n += 1;
        }
        step.id = default_step_id(n);
    }
}

/// The step at `idx`; the id stays empty unless the draft declares one.
fn normalize_step(idx: usize, item: &Value) -> Result<Step, String> {
    let map = match item {
        Value::String(title) => return Ok(Step::new(String::new(), title.trim())),
        Value::Object(map) => map,
        _ => return Err(format!("step {} must be a string or an object", idx + 1)),
    };

    let text = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let list = |keys: &[&str]| -> Vec<String> {
        keys.iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let title = text(&["title", "name"]).unwrap_or_else(|| format!("Step {}", idx + 1));
    let max_attempts = map
        .get("maxAttempts")
        .or_else(|| map.get("max_attempts"))
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);

    Ok(Step {
        id: text(&["id"]).unwrap_or_default(),
        description: text(&["description", "details"]).unwrap_or_else(|| title.clone()),
        title,
        success_criteria: text(&["successCriteria", "success_criteria"]).unwrap_or_default(),
        status: StepStatus::Pending,
        attempts: 0,
        max_attempts,
        kind: parse_enum::<StepType>(map.get("type")).unwrap_or_default(),
        files: list(&["files"]),
        risk_level: parse_enum::<RiskLevel>(map.get("riskLevel").or_else(|| map.get("risk_level")))
            .unwrap_or_default(),
        owner: text(&["owner"]).unwrap_or_else(|| DEFAULT_OWNER.to_string()),
        post_checks: list(&["postChecks", "post_checks"]),
        rollback_hint: text(&["rollbackHint", "rollback_hint"]).unwrap_or_default(),
    })
}

/// Unknown enum spellings fall back to the default rather than failing the draft.
fn parse_enum<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Option<T> {
    let raw = value?.as_str()?.trim().to_ascii_lowercase();
    serde_json::from_value(Value::String(raw)).ok()
}
