//! Run configuration stored in `planrun.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderId, ReasoningEffort};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "planrun.toml";

/// Plan runner configuration (TOML).
///
/// Every section is optional; missing fields fall back to the defaults below.
/// CLI flags are applied on top of the loaded values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PlanrunConfig {
    pub run: RunSection,
    pub provider: ProviderSection,
    pub post_checks: PostCheckSection,
    pub logging: LoggingSection,
    pub context: ContextSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSection {
    pub plan_path: PathBuf,
    pub auto_commit: bool,
    pub allow_dirty: bool,
    pub dry_run: bool,
    /// Abort when a required provider capability is missing.
    pub strict_capabilities: bool,
    /// Overrides `metadata.totalIterations` when set.
    pub total_iterations: Option<u32>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            plan_path: PathBuf::from("plan.json"),
            auto_commit: false,
            allow_dirty: false,
            dry_run: false,
            strict_capabilities: false,
            total_iterations: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSection {
    pub id: ProviderId,
    /// Empty means the provider's default model.
    pub model: String,
    pub reasoning_effort: ReasoningEffort,
    /// Wall-clock budget for one provider call.
    pub timeout_secs: u64,
    /// Longest silence tolerated from a streaming provider.
    pub stall_timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub probe_timeout_secs: u64,
    /// Executable to run instead of the provider's CLI name on `PATH`.
    pub binary: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        let id = ProviderId::Codex;
        Self {
            model: id.default_model().to_string(),
            id,
            reasoning_effort: ReasoningEffort::Medium,
            timeout_secs: 30 * 60,
            stall_timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
            probe_timeout_secs: 20,
            binary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostCheckSection {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for PostCheckSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// JSONL file plus a one-line rendering per event on stdout.
    #[default]
    Text,
    /// JSONL file only.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory holding run logs; retention applies to it.
    pub dir: PathBuf,
    /// Explicit log file; defaults to a timestamped file inside `dir`.
    pub file: Option<PathBuf>,
    pub output: OutputMode,
    pub retention_days: u32,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".planrun").join("run-logs"),
            file: None,
            output: OutputMode::Text,
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ContextSection {
    /// Documents that must exist before the run starts.
    pub required: Vec<PathBuf>,
    pub conditional: Vec<ConditionalContext>,
    /// Downgrade missing documents to a logged warning.
    pub allow_missing: bool,
}

/// Documents required only when a step touches files under `path_prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionalContext {
    pub path_prefix: String,
    pub files: Vec<PathBuf>,
}

impl PlanrunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provider.model.trim().is_empty() {
            return Err(anyhow!("provider.model must be non-empty"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.stall_timeout_secs == 0 {
            return Err(anyhow!("provider.stall_timeout_secs must be > 0"));
        }
        if self.provider.probe_timeout_secs == 0 {
            return Err(anyhow!("provider.probe_timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if self.post_checks.timeout_secs == 0 {
            return Err(anyhow!("post_checks.timeout_secs must be > 0"));
        }
        if self.post_checks.output_limit_bytes == 0 {
            return Err(anyhow!("post_checks.output_limit_bytes must be > 0"));
        }
        if self.logging.retention_days == 0 {
            return Err(anyhow!("logging.retention_days must be > 0"));
        }
        if self.run.total_iterations == Some(0) {
            return Err(anyhow!("run.total_iterations must be > 0 when set"));
        }
        if let Some(rule) = self
            .context
            .conditional
            .iter()
            .find(|rule| rule.path_prefix.trim().is_empty())
        {
            return Err(anyhow!(
                "context.conditional path_prefix must be non-empty (files: {:?})",
                rule.files
            ));
        }
        Ok(())
    }

    /// Switch provider, resetting the model to the new provider's default.
    pub fn set_provider(&mut self, id: ProviderId) {
        if self.provider.id != id {
            self.provider.id = id;
            self.provider.model = id.default_model().to_string();
            self.provider.binary = None;
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PlanrunConfig::default()`.
pub fn load_config(path: &Path) -> Result<PlanrunConfig> {
    if !path.exists() {
        let cfg = PlanrunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PlanrunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
