//! Versioned plan migrations.
//!
//! Each transform upgrades a raw JSON document by exactly one schema version
//! and is pure. [`migrate_to_current`] applies them in order until the current
//! version is reached; documents newer than this build are rejected.

use serde_json::{Map, Value, json};

use crate::plan::{CURRENT_SCHEMA_VERSION, DEFAULT_MAX_ATTEMPTS, DEFAULT_OWNER};

/// Schema version assumed for documents without a `schemaVersion` field.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

type Transform = fn(Value) -> Result<Value, String>;

/// `(from_version, transform)` pairs in application order.
const CHAIN: [(u32, Transform); 2] = [(1, v1_to_v2), (2, v2_to_v3)];

/// Read the declared schema version of a raw plan document.
pub fn schema_version(doc: &Value) -> Result<u32, String> {
    match doc.get("schemaVersion") {
        None | Some(Value::Null) => Ok(LEGACY_SCHEMA_VERSION),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| format!("invalid schemaVersion {n}")),
        Some(other) => Err(format!("schemaVersion must be an integer, got {other}")),
    }
}

/// Upgrade `doc` to [`CURRENT_SCHEMA_VERSION`].
///
/// Returns the migrated document and the version it started at.
pub fn migrate_to_current(mut doc: Value) -> Result<(Value, u32), String> {
    if !doc.is_object() {
        return Err("plan must be a JSON object".to_string());
    }
    let original = schema_version(&doc)?;
    if original > CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "unsupported schemaVersion {original} (newest known is {CURRENT_SCHEMA_VERSION})"
        ));
    }

    let mut version = original;
    for (from, transform) in CHAIN {
        if version == from {
            doc = transform(doc)?;
            version = from + 1;
            set_version(&mut doc, version);
        }
    }
    debug_assert_eq!(version, CURRENT_SCHEMA_VERSION);
    Ok((doc, original))
}

/// v1 -> v2: introduce `metadata`, retry budgets, step types and the
/// `in_progress`/`done` status names.
pub fn v1_to_v2(mut doc: Value) -> Result<Value, String> {
    let root = as_object(&mut doc, "plan")?;

    let provider = root.remove("provider").unwrap_or(Value::Null);
    let model = root.remove("model").unwrap_or(Value::Null);

    let steps = steps_mut(root)?;
    let mut budget: u64 = 0;
    for step in steps.iter_mut() {
        let step = as_object(step, "step")?;
        fill_default(step, "maxAttempts", json!(DEFAULT_MAX_ATTEMPTS));
        fill_default(step, "successCriteria", json!(""));
        fill_default(step, "type", json!("mixed"));
        fill_default(step, "attempts", json!(0));
        fill_default(step, "status", json!("pending"));
        if let Some(Value::String(status)) = step.get_mut("status") {
            match status.as_str() {
                "running" => *status = "in_progress".to_string(),
                "completed" => *status = "done".to_string(),
                _ => {}
            }
        }
        budget += step
            .get("maxAttempts")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(DEFAULT_MAX_ATTEMPTS));
    }

    if !root.contains_key("metadata") {
        root.insert(
            "metadata".to_string(),
            json!({
                "provider": string_or_empty(provider),
                "model": string_or_empty(model),
                "totalIterations": budget,
                "completedIterations": 0,
            }),
        );
    }
    Ok(doc)
}

/// v2 -> v3: per-step file scope, risk, ownership, post-checks and rollback hints.
pub fn v2_to_v3(mut doc: Value) -> Result<Value, String> {
    let root = as_object(&mut doc, "plan")?;
    for step in steps_mut(root)?.iter_mut() {
        let step = as_object(step, "step")?;
        fill_default(step, "files", json!([]));
        fill_default(step, "riskLevel", json!("medium"));
        fill_default(step, "owner", json!(DEFAULT_OWNER));
        fill_default(step, "postChecks", json!([]));
        fill_default(step, "rollbackHint", json!(""));
    }
    Ok(doc)
}

fn set_version(doc: &mut Value, version: u32) {
    if let Value::Object(map) = doc {
        map.insert("schemaVersion".to_string(), json!(version));
    }
}

fn as_object<'a>(value: &'a mut Value, what: &str) -> Result<&'a mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| format!("{what} must be a JSON object"))
}

fn steps_mut(root: &mut Map<String, Value>) -> Result<&mut Vec<Value>, String> {
    let steps = root.entry("steps").or_insert_with(|| json!([]));
    steps
        .as_array_mut()
        .ok_or_else(|| "steps must be an array".to_string())
}

/// Insert `default` when `key` is absent or null.
fn fill_default(map: &mut Map<String, Value>, key: &str, default: Value) {
    match map.get(key) {
        None | Some(Value::Null) => {
            map.insert(key.to_string(), default);
        }
        Some(_) => {}
    }
}

fn string_or_empty(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s),
        _ => Value::String(String::new()),
    }
}
