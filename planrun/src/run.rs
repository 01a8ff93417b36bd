//! Orchestration for `planrun run`: bootstrap, then hand off to the loop.
//!
//! Bootstrap loads the plan, repairs crash leftovers, checks context
//! documents, probes the provider once and captures the worktree state.
//! Fatal problems surface as [`RunError`]s before any step executes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::auto_commit::{AutoCommitDecision, AutoCommitRequest, decide};
use crate::core::capabilities::ProbeReport;
use crate::core::state_update::recover_in_progress;
use crate::core::types::WorktreeState;
use crate::error::RunError;
use crate::io::config::PlanrunConfig;
use crate::io::context_files::{ContextFiles, missing_documents};
use crate::io::git::Worktree;
use crate::io::help::{HelpReader, probe};
use crate::io::plan_store::{load_plan, save_plan};
use crate::io::post_checks::{PostCheckRequest, PostCheckRunner};
use crate::io::run_log::{Group, RunLogSettings, RunLogger, default_log_path};
use crate::io::telemetry::OtlpConfig;
use crate::looping::{LoopConfig, LoopDeps, LoopOutcome, LoopStop, run_loop};
use crate::plan::Plan;
use crate::provider::{OutputSchema, Provider};

const STEP_REPORT_SCHEMA: &str = include_str!("../schemas/step_report.schema.json");

/// Scratch directory for files planrun writes next to the plan.
pub const PLANRUN_DIR: &str = ".planrun";

/// Where the step-report schema is written for path-based providers.
pub const STEP_REPORT_SCHEMA_PATH: &str = ".planrun/step-report.schema.json";

/// Fully resolved inputs of one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workdir: PathBuf,
    pub config: PlanrunConfig,
}

impl RunSettings {
    pub fn plan_path(&self) -> PathBuf {
        self.resolve(&self.config.run.plan_path)
    }

    /// Run-log settings; the file defaults to a timestamped name in the log dir.
    pub fn log_settings(&self, now: DateTime<Utc>) -> RunLogSettings {
        let logging = &self.config.logging;
        let dir = self.resolve(&logging.dir);
        let path = match &logging.file {
            Some(file) => self.resolve(file),
            None => default_log_path(&dir, now),
        };
        RunLogSettings {
            path,
            output: logging.output,
            retention_dir: dir,
            retention_days: logging.retention_days,
            otlp: OtlpConfig::from_env(),
            provider: self.config.provider.id.to_string(),
            model: self.config.provider.model.clone(),
        }
    }

    /// Files and directories planrun writes into the working tree.
    pub fn owned_paths(&self) -> Vec<PathBuf> {
        let logging = &self.config.logging;
        let mut paths = vec![
            self.plan_path(),
            self.resolve(&logging.dir),
            self.resolve(Path::new(PLANRUN_DIR)),
        ];
        if let Some(file) = &logging.file {
            paths.push(self.resolve(file));
        }
        paths
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

/// Collaborators for one run.
pub struct RunDeps<'a, P, H, R, C, W> {
    pub provider: &'a P,
    pub help: &'a H,
    pub post_checks: &'a R,
    pub context: &'a C,
    pub worktree: &'a W,
}

/// Bootstrap and run the loop, logging how the run ended.
///
/// Errors are pre-run failures or persistence failures; they are logged as
/// `run_failed` before being returned.
pub fn run_plan<P, H, R, C, W>(
    settings: &RunSettings,
    deps: &RunDeps<'_, P, H, R, C, W>,
    logger: &mut RunLogger,
) -> Result<LoopOutcome>
where
    P: Provider,
    H: HelpReader,
    R: PostCheckRunner,
    C: ContextFiles,
    W: Worktree,
{
    let result = bootstrap(settings, deps, logger).and_then(|(mut plan, loop_config)| {
        let loop_deps = LoopDeps {
            provider: deps.provider,
            post_checks: deps.post_checks,
            worktree: deps.worktree,
        };
        run_loop(&mut plan, &loop_config, &loop_deps, logger)
    });
    logger.set_group(Group::Run);
    match &result {
        Ok(outcome) => log_stop(logger, outcome)?,
        Err(err) => {
            if let Err(log_err) = logger.error("run_failed", json!({ "error": format!("{err:#}") })) {
                warn!(err = %format!("{log_err:#}"), "could not record run_failed");
            }
        }
    }
    result
}

#[instrument(skip_all, fields(plan = %settings.plan_path().display()))]
fn bootstrap<P, H, R, C, W>(
    settings: &RunSettings,
    deps: &RunDeps<'_, P, H, R, C, W>,
    logger: &mut RunLogger,
) -> Result<(Plan, LoopConfig)>
where
    P: Provider,
    H: HelpReader,
    C: ContextFiles,
    W: Worktree,
{
    let config = &settings.config;
    let dry_run = config.run.dry_run;
    let plan_path = settings.plan_path();
    logger.set_group(Group::Run);

    let loaded = load_plan(&plan_path)?;
    let mut plan = loaded.plan;
    if let Some(from) = loaded.migrated_from {
        logger.info(
            "plan_migrated",
            json!({ "from": from, "to": plan.schema_version }),
        )?;
    }

    let provider_id = config.provider.id.as_str();
    if plan.metadata.provider != provider_id {
        if plan.metadata.resume_session_id.is_some() {
            plan.clear_session();
            logger.info(
                "session_cleared",
                json!({
                    "reason": "provider_changed",
                    "from": plan.metadata.provider,
                    "to": provider_id,
                }),
            )?;
        }
        plan.metadata.provider = provider_id.to_string();
    }
    plan.metadata.model.clone_from(&config.provider.model);
    if let Some(total) = config.run.total_iterations {
        plan.metadata.total_iterations = total;
    }

    for step_id in recover_in_progress(&mut plan) {
        logger.warn(
            "step_recovered",
            json!({ "step_id": step_id, "from": "in_progress", "to": "pending" }),
        )?;
    }

    let missing = missing_documents(deps.context, &config.context, &plan);
    if !missing.is_empty() {
        if !config.context.allow_missing {
            return Err(RunError::MissingContext { missing }.into());
        }
        logger.warn(
            "context_warning",
            json!({ "missing": display_paths(&missing) }),
        )?;
    }

    let report = probe(deps.provider, deps.help, config.run.strict_capabilities)?;
    log_probe(logger, &report)?;
    if !report.supports_resume && plan.metadata.resume_session_id.is_some() {
        plan.clear_session();
        logger.info("session_cleared", json!({ "reason": "resume_unsupported" }))?;
    }

    let auto_commit = auto_commit_decision(config, deps.worktree, logger)?;
    let output_schema = output_schema(&settings.workdir, &report, dry_run)?;

    if !dry_run {
        save_plan(&plan_path, &plan)?;
    }
    logger.info(
        "run_started",
        json!({
            "plan": plan_path.display().to_string(),
            "goal": plan.goal,
            "steps": plan.steps.len(),
            "completed_iterations": plan.metadata.completed_iterations,
            "total_iterations": plan.metadata.total_iterations,
            "dry_run": dry_run,
            "auto_commit": auto_commit.auto_commit,
        }),
    )?;
    info!(steps = plan.steps.len(), dry_run, "bootstrap finished");

    let loop_config = LoopConfig {
        workdir: settings.workdir.clone(),
        plan_path,
        model: config.provider.model.clone(),
        reasoning: config.provider.reasoning_effort,
        provider_timeout: Duration::from_secs(config.provider.timeout_secs),
        stall_timeout: Duration::from_secs(config.provider.stall_timeout_secs),
        output_limit_bytes: config.provider.output_limit_bytes,
        post_checks: PostCheckRequest {
            workdir: settings.workdir.clone(),
            timeout: Duration::from_secs(config.post_checks.timeout_secs),
            output_limit_bytes: config.post_checks.output_limit_bytes,
        },
        dry_run,
        auto_commit,
        supports_resume: report.supports_resume,
        output_schema,
    };
    Ok((plan, loop_config))
}

fn log_probe(logger: &mut RunLogger, report: &ProbeReport) -> Result<()> {
    logger.info(
        "capability_probe",
        serde_json::to_value(report).context("serialize probe report")?,
    )?;
    for warning in &report.warnings {
        logger.warn("capability_warning", json!({ "message": warning }))?;
    }
    Ok(())
}

/// Decide once per run; the worktree is only inspected when a commit could
/// actually happen.
fn auto_commit_decision<W: Worktree>(
    config: &PlanrunConfig,
    worktree: &W,
    logger: &mut RunLogger,
) -> Result<AutoCommitDecision> {
    let run = &config.run;
    let state = if run.auto_commit && !run.dry_run {
        let state = worktree.state();
        logger.info("worktree_state", worktree_fields(&state))?;
        state
    } else {
        // Not consulted by `decide` for this request.
        WorktreeState::Available { dirty: false }
    };
    let decision = decide(&AutoCommitRequest {
        requested: run.auto_commit,
        dry_run: run.dry_run,
        allow_dirty: run.allow_dirty,
        worktree: &state,
    });
    if let Some(warning) = &decision.warning {
        logger.warn("auto_commit_warning", json!({ "message": warning }))?;
    }
    Ok(decision)
}

fn worktree_fields(state: &WorktreeState) -> Value {
    match state {
        WorktreeState::Unavailable { error } => json!({ "available": false, "error": error }),
        WorktreeState::Available { dirty } => json!({ "available": true, "dirty": dirty }),
    }
}

/// The step-report schema, when the probe says the provider can enforce one.
fn output_schema(workdir: &Path, report: &ProbeReport, dry_run: bool) -> Result<Option<OutputSchema>> {
    if !report.supports_output_schema_path && !report.supports_json_schema {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(STEP_REPORT_SCHEMA).context("parse step report schema")?;
    let path = workdir.join(STEP_REPORT_SCHEMA_PATH);
    if report.supports_output_schema_path && !dry_run {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, STEP_REPORT_SCHEMA)
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "wrote step report schema");
    }
    Ok(Some(OutputSchema { path, value }))
}

fn log_stop(logger: &mut RunLogger, outcome: &LoopOutcome) -> Result<()> {
    let iterations = outcome.iterations;
    match &outcome.stop {
        LoopStop::Complete { failed_steps } if failed_steps.is_empty() => {
            logger.info("run_completed", json!({ "iterations": iterations }))
        }
        LoopStop::Complete { failed_steps } => logger.warn(
            "run_halted",
            json!({
                "reason": "steps_failed",
                "failed_steps": failed_steps,
                "iterations": iterations,
            }),
        ),
        LoopStop::StepFailed {
            step_id,
            attempts,
            max_attempts,
            detail,
        } => logger.error(
            "run_halted",
            json!({
                "reason": "step_failed",
                "step_id": step_id,
                "attempts": attempts,
                "max_attempts": max_attempts,
                "detail": detail,
                "iterations": iterations,
            }),
        ),
        LoopStop::IterationLimit {
            completed_iterations,
            total_iterations,
        } => logger.warn(
            "run_halted",
            json!({
                "reason": "iteration_limit",
                "completed_iterations": completed_iterations,
                "total_iterations": total_iterations,
                "iterations": iterations,
            }),
        ),
        LoopStop::DryRun { steps } => logger.info(
            "run_completed",
            json!({ "dry_run": true, "steps": steps }),
        ),
    }
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|path| path.display().to_string()).collect()
}
