//! Plan data model persisted to the plan file.
//!
//! The on-disk shape is camelCase JSON. Older schema versions are upgraded by
//! [`crate::core::migrate`] before they are deserialized into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Default retry budget for steps that do not declare one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default owner recorded for steps executed by an agent.
pub const DEFAULT_OWNER: &str = "agent";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub schema_version: u32,
    pub goal: String,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<Step>,
    pub metadata: RunMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub title: String,
    pub description: String,
    pub success_criteria: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(rename = "type")]
    pub kind: StepType,
    pub files: Vec<String>,
    pub risk_level: RiskLevel,
    pub owner: String,
    pub post_checks: Vec<String>,
    pub rollback_hint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub provider: String,
    pub model: String,
    pub total_iterations: u32,
    pub completed_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    /// Step that owns `resume_session_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_step_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Code,
    Docs,
    Test,
    Governance,
    Ops,
    #[default]
    Mixed,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl Step {
    /// A fresh pending step with every optional field defaulted.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            description: title.clone(),
            title,
            success_criteria: String::new(),
            status: StepStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            kind: StepType::default(),
            files: Vec::new(),
            risk_level: RiskLevel::default(),
            owner: DEFAULT_OWNER.to_string(),
            post_checks: Vec::new(),
            rollback_hint: String::new(),
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Failed with no retry budget left.
    pub fn is_exhausted(&self) -> bool {
        self.status == StepStatus::Failed && !self.attempts_remaining()
    }
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.id == id)
    }

    /// Sum of every step's retry budget; the default iteration budget.
    pub fn attempt_budget(&self) -> u32 {
        self.steps.iter().map(|step| step.max_attempts).sum()
    }

    /// Forget the resumable session and the step that owned it.
    pub fn clear_session(&mut self) {
        self.metadata.resume_session_id = None;
        self.metadata.resume_step_id = None;
    }

    /// Session id to resume for `step_id`, if the stored session belongs to it.
    pub fn session_for(&self, step_id: &str) -> Option<&str> {
        match (
            self.metadata.resume_session_id.as_deref(),
            self.metadata.resume_step_id.as_deref(),
        ) {
            (Some(session), Some(owner)) if owner == step_id => Some(session),
            _ => None,
        }
    }
}
