//! The execution loop behind `planrun run`.
//!
//! One iteration is one attempt at one step: select, mark `in_progress` and
//! persist, call the provider, run post-checks, classify, apply the
//! transition and persist again. Per-step failures are retried or halt the
//! loop; only plan persistence and run-log I/O errors propagate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::auto_commit::AutoCommitDecision;
use crate::core::classifier::{ProviderVerdict, classify};
use crate::core::selector::{Selection, eligible_steps, next_step};
use crate::core::state_update::{
    Transition, apply_outcome, begin_attempt, complete_iteration, record_session,
};
use crate::core::types::{AttemptOutcome, PostCheckResult};
use crate::io::git::Worktree;
use crate::io::plan_store::save_plan;
use crate::io::post_checks::{PostCheckRequest, PostCheckRunner, run_post_checks};
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::run_log::{Group, RunLogger};
use crate::plan::{Plan, Step};
use crate::provider::{
    ExecRequest, ExecResult, OutputSchema, Provider, ReasoningEffort, SessionStrategy, StreamEvent,
};

/// Result text kept on the summary `provider_event`.
const RESULT_TEXT_LIMIT: usize = 2_000;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Nothing is left to run. `failed_steps` lists steps that were already
    /// permanently failed when the loop found no more work.
    Complete { failed_steps: Vec<String> },
    /// A step used up its attempts during this run.
    StepFailed {
        step_id: String,
        attempts: u32,
        max_attempts: u32,
        detail: String,
    },
    /// `completedIterations` reached `totalIterations` with work remaining.
    IterationLimit {
        completed_iterations: u32,
        total_iterations: u32,
    },
    /// Commands were logged, nothing was executed.
    DryRun { steps: usize },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Iterations executed by this invocation.
    pub iterations: u32,
    pub stop: LoopStop,
}

/// Per-run settings the loop needs; resolved by [`crate::run`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub workdir: PathBuf,
    pub plan_path: PathBuf,
    pub model: String,
    pub reasoning: ReasoningEffort,
    pub provider_timeout: Duration,
    pub stall_timeout: Duration,
    pub output_limit_bytes: usize,
    pub post_checks: PostCheckRequest,
    pub dry_run: bool,
    pub auto_commit: AutoCommitDecision,
    /// Probe result: sessions may be resumed.
    pub supports_resume: bool,
    /// Schema handed to the provider, when it can enforce one.
    pub output_schema: Option<OutputSchema>,
}

/// Collaborators driven by the loop.
pub struct LoopDeps<'a, P, R, W> {
    pub provider: &'a P,
    pub post_checks: &'a R,
    pub worktree: &'a W,
}

/// Run iterations until the plan completes, a step is exhausted, or the
/// iteration budget is spent.
pub fn run_loop<P: Provider, R: PostCheckRunner, W: Worktree>(
    plan: &mut Plan,
    config: &LoopConfig,
    deps: &LoopDeps<'_, P, R, W>,
    logger: &mut RunLogger,
) -> Result<LoopOutcome> {
    let prompts = PromptEngine::new()?;
    if config.dry_run {
        return dry_run(plan, config, deps.provider, &prompts, logger);
    }

    let mut failures: HashMap<String, String> = HashMap::new();
    let mut iterations = 0u32;
    loop {
        let step_id = match next_step(plan) {
            Selection::Complete => {
                return Ok(LoopOutcome {
                    iterations,
                    stop: LoopStop::Complete {
                        failed_steps: Vec::new(),
                    },
                });
            }
            Selection::Exhausted => {
                let failed_steps = plan
                    .steps
                    .iter()
                    .filter(|step| step.is_exhausted())
                    .map(|step| step.id.clone())
                    .collect();
                return Ok(LoopOutcome {
                    iterations,
                    stop: LoopStop::Complete { failed_steps },
                });
            }
            Selection::Next(_, step) => step.id.clone(),
        };

        let meta = &plan.metadata;
        if meta.completed_iterations >= meta.total_iterations {
            return Ok(LoopOutcome {
                iterations,
                stop: LoopStop::IterationLimit {
                    completed_iterations: meta.completed_iterations,
                    total_iterations: meta.total_iterations,
                },
            });
        }

        let iteration = meta.completed_iterations + 1;
        let transition = run_iteration(
            plan,
            &step_id,
            iteration,
            config,
            deps,
            &prompts,
            &mut failures,
            logger,
        )?;
        iterations += 1;

        if let Transition::Exhausted {
            attempts,
            max_attempts,
        } = transition
        {
            return Ok(LoopOutcome {
                iterations,
                stop: LoopStop::StepFailed {
                    detail: failures.remove(&step_id).unwrap_or_default(),
                    step_id,
                    attempts,
                    max_attempts,
                },
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(step = %step_id, iteration = iteration))]
fn run_iteration<P: Provider, R: PostCheckRunner, W: Worktree>(
    plan: &mut Plan,
    step_id: &str,
    iteration: u32,
    config: &LoopConfig,
    deps: &LoopDeps<'_, P, R, W>,
    prompts: &PromptEngine,
    failures: &mut HashMap<String, String>,
    logger: &mut RunLogger,
) -> Result<Transition> {
    logger.set_group(Group::Iteration(iteration));
    logger.info(
        "iteration_started",
        json!({ "iteration": iteration, "step_id": step_id }),
    )?;

    begin_attempt(plan, step_id).map_err(|reason| anyhow!(reason))?;
    persist(config, plan)?;
    logger.set_group(Group::Step {
        step_id: step_id.to_string(),
        iteration,
    });

    let step = plan
        .step(step_id)
        .ok_or_else(|| anyhow!("step '{step_id}' vanished from the plan"))?
        .clone();
    let request = build_request(plan, &step, config, prompts, failures.get(step_id))?;
    logger.info(
        "step_started",
        json!({
            "step_id": step_id,
            "title": step.title,
            "attempt": step.attempts + 1,
            "max_attempts": step.max_attempts,
            "session": session_name(request.session),
        }),
    )?;

    let started = Instant::now();
    let result = call_provider(deps.provider, &request, logger)?;
    logger.info(
        "provider_event",
        json!({
            "kind": "result",
            "ok": result.ok,
            "exit_code": result.exit_code,
            "timed_out": result.timed_out,
            "session_id": result.session_id,
            "command": result.command,
            "error": result.error,
            "text": crate::provider::tail(&result.normalized_text, RESULT_TEXT_LIMIT),
            "duration_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }),
    )?;

    let checks: Vec<PostCheckResult> = if result.ok {
        run_post_checks(deps.post_checks, &step.post_checks, &config.post_checks)
    } else {
        Vec::new()
    };
    for check in &checks {
        logger.info(
            "post_check",
            json!({
                "command": check.command,
                "exit_code": check.exit_code,
                "timed_out": check.timed_out,
                "passed": check.passed(),
                "output": check.output,
            }),
        )?;
    }

    let outcome = classify(
        &ProviderVerdict {
            ok: result.ok,
            timed_out: result.timed_out,
            exit_code: result.exit_code,
            error: result.error.as_deref(),
        },
        &checks,
    );
    if config.supports_resume {
        record_session(plan, step_id, result.session_id.as_deref());
    }
    let transition = apply_outcome(plan, step_id, &outcome).map_err(|reason| anyhow!(reason))?;
    persist(config, plan)?;
    log_transition(logger, step_id, &outcome, &transition)?;

    match &outcome {
        AttemptOutcome::Failed(failure) => {
            failures.insert(
                step_id.to_string(),
                format!("{}: {}", failure.kind.as_str(), failure.detail),
            );
        }
        AttemptOutcome::Succeeded => {
            failures.remove(step_id);
            if config.auto_commit.auto_commit {
                commit_step(deps.worktree, &step, logger)?;
            }
        }
    }

    let completed = complete_iteration(plan);
    persist(config, plan)?;
    logger.set_group(Group::Iteration(iteration));
    logger.info(
        "iteration_completed",
        json!({
            "iteration": iteration,
            "step_id": step_id,
            "result": transition_name(&transition),
            "completed_iterations": completed,
            "total_iterations": plan.metadata.total_iterations,
        }),
    )?;
    info!(step = step_id, result = transition_name(&transition), "iteration finished");
    Ok(transition)
}

fn build_request(
    plan: &Plan,
    step: &Step,
    config: &LoopConfig,
    prompts: &PromptEngine,
    previous_failure: Option<&String>,
) -> Result<ExecRequest> {
    let prompt = prompts.render_step(&PromptInputs {
        goal: &plan.goal,
        step,
        attempt: step.attempts + 1,
        previous_failure: previous_failure.map(String::as_str),
        structured_output: config.output_schema.is_some(),
    })?;
    let resume_session_id = config
        .supports_resume
        .then(|| plan.session_for(&step.id))
        .flatten()
        .map(str::to_string);
    Ok(ExecRequest {
        model: config.model.clone(),
        reasoning: config.reasoning,
        prompt,
        workdir: config.workdir.clone(),
        timeout: config.provider_timeout,
        stall_timeout: config.stall_timeout,
        output_limit_bytes: config.output_limit_bytes,
        session: if resume_session_id.is_some() {
            SessionStrategy::Resume
        } else {
            SessionStrategy::New
        },
        resume_session_id,
        output_schema: config.output_schema.clone(),
    })
}

/// Execute the provider, logging each stream event as it arrives.
///
/// A provider that cannot even be spawned is an attempt failure, not a loop
/// error.
fn call_provider<P: Provider>(
    provider: &P,
    request: &ExecRequest,
    logger: &mut RunLogger,
) -> Result<ExecResult> {
    let mut log_error = None;
    let mut sink = |event: StreamEvent| {
        if log_error.is_some() {
            return;
        }
        let fields = json!({
            "kind": event.kind.as_str(),
            "tool": event.tool,
            "text": event.text,
            "is_error": event.is_error,
        });
        if let Err(err) = logger.info("provider_event", fields) {
            log_error = Some(err);
        }
    };
    let result = provider.execute(request, &mut sink);
    if let Some(err) = log_error {
        return Err(err);
    }
    Ok(result.unwrap_or_else(|err| {
        let command = provider.build_command(request).display();
        debug!(err = %format!("{err:#}"), "provider could not run");
        ExecResult {
            ok: false,
            command,
            error: Some(format!("{err:#}")),
            ..ExecResult::default()
        }
    }))
}

fn log_transition(
    logger: &mut RunLogger,
    step_id: &str,
    outcome: &AttemptOutcome,
    transition: &Transition,
) -> Result<()> {
    let (kind, detail) = match outcome {
        AttemptOutcome::Failed(failure) => (Some(failure.kind.as_str()), Some(failure.detail.as_str())),
        AttemptOutcome::Succeeded => (None, None),
    };
    match transition {
        Transition::Completed => logger.info("step_completed", json!({ "step_id": step_id })),
        Transition::Requeued {
            attempts,
            max_attempts,
        } => logger.warn(
            "step_requeued",
            json!({
                "step_id": step_id,
                "failure_kind": kind,
                "detail": detail,
                "attempts": attempts,
                "max_attempts": max_attempts,
            }),
        ),
        Transition::Exhausted {
            attempts,
            max_attempts,
        } => logger.error(
            "step_failed",
            json!({
                "step_id": step_id,
                "failure_kind": kind,
                "detail": detail,
                "attempts": attempts,
                "max_attempts": max_attempts,
            }),
        ),
    }
}

/// Commit the step's changes; a failed commit is only a warning.
fn commit_step<W: Worktree>(worktree: &W, step: &Step, logger: &mut RunLogger) -> Result<()> {
    let message = format!("planrun: {} {}", step.id, step.title.trim());
    match worktree.commit_all(&message) {
        Ok(committed) => logger.info(
            "commit",
            json!({ "step_id": step.id, "committed": committed, "message": message }),
        ),
        Err(err) => logger.warn(
            "auto_commit_warning",
            json!({ "step_id": step.id, "message": format!("commit failed: {err:#}") }),
        ),
    }
}

/// Log the command each eligible step would run; touch nothing.
fn dry_run<P: Provider>(
    plan: &Plan,
    config: &LoopConfig,
    provider: &P,
    prompts: &PromptEngine,
    logger: &mut RunLogger,
) -> Result<LoopOutcome> {
    let mut steps = 0;
    for step in eligible_steps(plan) {
        let request = build_request(plan, step, config, prompts, None)?;
        let command = provider.build_command(&request);
        logger.info(
            "dry_run_step",
            json!({
                "step_id": step.id,
                "title": step.title,
                "command": command.display(),
                "session": session_name(request.session),
                "prompt_bytes": request.prompt.len(),
                "post_checks": step.post_checks,
            }),
        )?;
        steps += 1;
    }
    Ok(LoopOutcome {
        iterations: 0,
        stop: LoopStop::DryRun { steps },
    })
}

fn persist(config: &LoopConfig, plan: &Plan) -> Result<()> {
    save_plan(&config.plan_path, plan)
        .with_context(|| format!("persist plan {}", config.plan_path.display()))
}

fn session_name(session: SessionStrategy) -> &'static str {
    match session {
        SessionStrategy::New => "new",
        SessionStrategy::Resume => "resume",
    }
}

fn transition_name(transition: &Transition) -> &'static str {
    match transition {
        Transition::Completed => "done",
        Transition::Requeued { .. } => "requeued",
        Transition::Exhausted { .. } => "failed",
    }
}
