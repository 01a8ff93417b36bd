//! Plan load/save with migration, schema and invariant validation.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::core::invariants::validate_invariants;
use crate::core::migrate::migrate_to_current;
use crate::error::RunError;
use crate::plan::Plan;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.v3.schema.json");

static PLAN_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PLAN_SCHEMA).map_err(|err| format!("parse plan schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid plan schema: {err}"))
});

/// A plan read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPlan {
    pub plan: Plan,
    /// Schema version found on disk, if it was older than current.
    pub migrated_from: Option<u32>,
}

/// Load a plan, migrating older schema versions in memory.
///
/// Errors carry a [`RunError`]: `PlanNotFound` when the file is absent and
/// `CorruptPlan` for unreadable JSON, unsupported versions, schema or
/// invariant violations. The file itself is never rewritten here.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_plan(path: &Path) -> Result<LoadedPlan> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(RunError::PlanNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        Err(err) => return Err(err).with_context(|| format!("read plan {}", path.display())),
    };
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| RunError::corrupt(path, format!("invalid JSON: {err}")))?;
    let (plan, original) =
        parse_plan_value(value).map_err(|reason| RunError::corrupt(path, reason))?;

    let migrated_from = (original < plan.schema_version).then_some(original);
    if let Some(from) = migrated_from {
        debug!(from, to = plan.schema_version, "migrated plan in memory");
    }
    Ok(LoadedPlan {
        plan,
        migrated_from,
    })
}

/// Migrate, validate and deserialize a raw plan document.
///
/// Returns the plan and the schema version the document declared.
pub fn parse_plan_value(value: Value) -> Result<(Plan, u32), String> {
    let (value, original) = migrate_to_current(value)?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value).map_err(|err| format!("deserialize: {err}"))?;
    let errors = validate_invariants(&plan);
    if !errors.is_empty() {
        return Err(format!("invariants failed: {}", errors.join("; ")));
    }
    Ok((plan, original))
}

/// Atomically write the plan, pretty JSON with a trailing newline.
///
/// The bytes go to a temp file in the same directory, are synced, then renamed over `path`.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn save_plan(path: &Path, plan: &Plan) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
            parent
        }
        None => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp plan in {}", dir.display()))?;
    tmp.write_all(buf.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("write temp plan {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace plan {}", path.display()))?;
    debug!("plan saved");
    Ok(())
}

fn validate_schema(value: &Value) -> Result<(), String> {
    let validator = PLAN_VALIDATOR.as_ref().map_err(Clone::clone)?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(format!("schema validation failed: {}", messages.join("; ")))
}

/// Check that the embedded schema compiles; used by `planrun validate`.
pub fn ensure_schema() -> Result<()> {
    PLAN_VALIDATOR
        .as_ref()
        .map(|_| ())
        .map_err(|err| anyhow!("{err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepStatus;
    use crate::test_support::{plan_with_steps, step, step_with};
    use serde_json::json;

    fn reason(err: &anyhow::Error) -> String {
        match err.downcast_ref::<RunError>() {
            Some(RunError::CorruptPlan { reason, .. }) => reason.clone(),
            other => panic!("expected CorruptPlan, got {other:?}"),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("plan.json");
        let mut plan = plan_with_steps(vec![step("a"), step_with("b", StepStatus::Failed, 1, 3)]);
        plan.metadata.resume_session_id = Some("sess".to_string());
        plan.metadata.resume_step_id = Some("b".to_string());

        save_plan(&path, &plan).expect("save");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.ends_with("}\n"));

        let loaded = load_plan(&path).expect("load");
        assert_eq!(loaded.plan, plan);
        assert_eq!(loaded.migrated_from, None);
    }

    #[test]
    fn overwriting_leaves_only_the_plan_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        save_plan(&path, &plan_with_steps(vec![step("a")])).expect("first save");
        let mut plan = plan_with_steps(vec![step("a"), step("b")]);
        plan.metadata.completed_iterations = 1;
        save_plan(&path, &plan).expect("second save");

        assert_eq!(load_plan(&path).expect("load").plan, plan);
        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["plan.json"]);
    }

    #[test]
    fn missing_file_is_plan_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_plan(&temp.path().join("plan.json")).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::PlanNotFound { .. })
        ));
    }

    #[test]
    fn invalid_json_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_plan(&path).expect_err("corrupt");
        assert!(reason(&err).contains("invalid JSON"));
    }

    #[test]
    fn future_version_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, r#"{"schemaVersion": 7, "steps": []}"#).expect("write");
        let err = load_plan(&path).expect_err("corrupt");
        assert!(reason(&err).contains("unsupported schemaVersion 7"));
    }

    #[test]
    fn schema_violation_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let mut value = serde_json::to_value(plan_with_steps(vec![step("a")])).expect("value");
        value["steps"][0]["status"] = json!("paused");
        fs::write(&path, value.to_string()).expect("write");
        let err = load_plan(&path).expect_err("corrupt");
        assert!(reason(&err).contains("schema validation failed"));
    }

    #[test]
    fn duplicate_ids_are_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        save_plan(&path, &plan_with_steps(vec![step("a"), step("a")])).expect("save");
        let err = load_plan(&path).expect_err("corrupt");
        assert!(reason(&err).contains("invariants failed"));
    }

    /// Older documents come back fully populated and the file is untouched.
    #[test]
    fn v1_and_v2_plans_migrate_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");

        let v1 = json!({
            "goal": "g",
            "createdAt": "2025-03-01T12:00:00Z",
            "provider": "claude",
            "model": "claude-sonnet-4-5",
            "steps": [{"id": "one", "title": "One", "description": "first", "status": "running", "attempts": 1}]
        });
        let v1_path = temp.path().join("v1.json");
        fs::write(&v1_path, v1.to_string()).expect("write");
        let loaded = load_plan(&v1_path).expect("load v1");
        assert_eq!(loaded.migrated_from, Some(1));
        let step = &loaded.plan.steps[0];
        assert_eq!(step.status, StepStatus::InProgress);
        assert_eq!(step.max_attempts, 3);
        assert!(step.files.is_empty());
        assert_eq!(step.owner, "agent");
        assert_eq!(loaded.plan.metadata.provider, "claude");
        assert_eq!(fs::read_to_string(&v1_path).expect("read"), v1.to_string());

        let v2 = json!({
            "schemaVersion": 2,
            "goal": "g",
            "createdAt": "2025-03-01T12:00:00Z",
            "steps": [{
                "id": "one", "title": "One", "description": "first", "successCriteria": "",
                "status": "pending", "attempts": 0, "maxAttempts": 2, "type": "code"
            }],
            "metadata": {"provider": "codex", "model": "m", "totalIterations": 2, "completedIterations": 0}
        });
        let v2_path = temp.path().join("v2.json");
        fs::write(&v2_path, v2.to_string()).expect("write");
        let loaded = load_plan(&v2_path).expect("load v2");
        assert_eq!(loaded.migrated_from, Some(2));
        assert_eq!(loaded.plan.steps[0].post_checks, Vec::<String>::new());
        assert_eq!(loaded.plan.steps[0].rollback_hint, "");
    }
}
