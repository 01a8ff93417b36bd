//! Plan runner CLI.
//!
//! Drives a coding-agent CLI (codex, claude or gemini) through the steps of a
//! plan file, one attempt per iteration, with retries, session resumption and
//! a redacted JSONL run log.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use planrun::core::normalize::{DraftContext, normalize_draft};
use planrun::exit_codes;
use planrun::io::config::{CONFIG_FILE_NAME, OutputMode, PlanrunConfig, load_config};
use planrun::io::context_files::FsContextFiles;
use planrun::io::git::Git;
use planrun::io::help::{CommandHelpReader, probe};
use planrun::io::plan_store::{ensure_schema, load_plan, parse_plan_value, save_plan};
use planrun::io::post_checks::ShellPostChecks;
use planrun::io::run_log::RunLogger;
use planrun::looping::LoopStop;
use planrun::plan::{Plan, StepStatus};
use planrun::provider::{Adapter, ProviderId, ReasoningEffort};
use planrun::run::{RunDeps, RunSettings, run_plan};

#[derive(Parser)]
#[command(
    name = "planrun",
    version,
    about = "Run a multi-step plan through a coding-agent CLI"
)]
struct Cli {
    /// Working directory the agent edits and paths resolve against.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the plan until it completes, a step fails, or the budget runs out.
    Run(RunArgs),
    /// Probe the provider CLI and print the capability report as JSON.
    Probe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        provider: Option<ProviderId>,
        /// Fail when a required capability is missing.
        #[arg(long)]
        strict: bool,
    },
    /// Load (migrating in memory) and check a plan file.
    Validate {
        #[arg(long, default_value = "plan.json")]
        plan: PathBuf,
    },
    /// Turn a draft step list into a complete plan file.
    Normalize {
        #[arg(long)]
        draft: PathBuf,
        #[arg(long, default_value = "")]
        goal: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "codex")]
        provider: ProviderId,
        /// Defaults to the provider's default model.
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Config file; defaults to `planrun.toml` in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    plan: Option<PathBuf>,
    #[arg(long)]
    provider: Option<ProviderId>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    reasoning: Option<ReasoningEffort>,
    /// Log the commands that would run; spawn nothing, write nothing.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    auto_commit: bool,
    /// Commit even if the tree was dirty before the run.
    #[arg(long)]
    allow_dirty: bool,
    /// Abort when a required provider capability is missing.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    allow_missing_context: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long, value_enum)]
    output: Option<OutputArg>,
    /// Override the plan's iteration budget.
    #[arg(long)]
    iterations: Option<u32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputArg {
    Text,
    Json,
}

impl From<OutputArg> for OutputMode {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Text => OutputMode::Text,
            OutputArg::Json => OutputMode::Json,
        }
    }
}

fn main() -> ExitCode {
    planrun::logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn dispatch(cli: Cli) -> Result<i32> {
    let workdir = cli.workdir;
    match cli.command {
        Command::Run(args) => cmd_run(&workdir, args),
        Command::Probe {
            config,
            provider,
            strict,
        } => cmd_probe(&workdir, config.as_deref(), provider, strict),
        Command::Validate { plan } => cmd_validate(&workdir.join(plan)),
        Command::Normalize {
            draft,
            goal,
            out,
            provider,
            model,
        } => cmd_normalize(&workdir.join(draft), goal, &workdir.join(out), provider, model),
    }
}

fn cmd_run(workdir: &Path, args: RunArgs) -> Result<i32> {
    let mut config = load_workdir_config(workdir, args.config.as_deref())?;
    apply_run_overrides(&mut config, args);
    config.validate().context("invalid configuration")?;

    let settings = RunSettings {
        workdir: workdir.to_path_buf(),
        config,
    };
    let config = &settings.config;
    let mut logger = RunLogger::open(settings.log_settings(Utc::now()))?;

    let provider = Adapter::new(config.provider.id, config.provider.binary.as_deref());
    let help = CommandHelpReader {
        timeout: Duration::from_secs(config.provider.probe_timeout_secs),
    };
    let context = FsContextFiles::new(workdir);
    let git = Git::new(workdir).excluding(settings.owned_paths());
    let deps = RunDeps {
        provider: &provider,
        help: &help,
        post_checks: &ShellPostChecks,
        context: &context,
        worktree: &git,
    };

    let outcome = run_plan(&settings, &deps, &mut logger)?;
    let log_path = logger.path().display().to_string();
    match &outcome.stop {
        LoopStop::Complete { failed_steps } if failed_steps.is_empty() => {
            eprintln!("plan complete after {} iterations (log: {log_path})", outcome.iterations);
        }
        LoopStop::Complete { failed_steps } => {
            eprintln!(
                "no runnable steps left; permanently failed: {} (log: {log_path})",
                failed_steps.join(", ")
            );
        }
        LoopStop::StepFailed {
            step_id,
            attempts,
            max_attempts,
            detail,
        } => {
            eprintln!(
                "step {step_id} failed after {attempts}/{max_attempts} attempts: {detail} (log: {log_path})"
            );
        }
        LoopStop::IterationLimit {
            completed_iterations,
            total_iterations,
        } => {
            eprintln!(
                "iteration limit reached ({completed_iterations}/{total_iterations}); work remains (log: {log_path})"
            );
        }
        LoopStop::DryRun { steps } => {
            eprintln!("dry run: {steps} steps would run (log: {log_path})");
        }
    }
    Ok(exit_codes::for_stop(&outcome.stop))
}

fn apply_run_overrides(config: &mut PlanrunConfig, args: RunArgs) {
    if let Some(provider) = args.provider {
        config.set_provider(provider);
    }
    if let Some(model) = args.model {
        config.provider.model = model;
    }
    if let Some(reasoning) = args.reasoning {
        config.provider.reasoning_effort = reasoning;
    }
    if let Some(plan) = args.plan {
        config.run.plan_path = plan;
    }
    if let Some(file) = args.log_file {
        config.logging.file = Some(file);
    }
    if let Some(output) = args.output {
        config.logging.output = output.into();
    }
    if let Some(iterations) = args.iterations {
        config.run.total_iterations = Some(iterations);
    }
    config.run.dry_run |= args.dry_run;
    config.run.auto_commit |= args.auto_commit;
    config.run.allow_dirty |= args.allow_dirty;
    config.run.strict_capabilities |= args.strict;
    config.context.allow_missing |= args.allow_missing_context;
}

fn cmd_probe(
    workdir: &Path,
    config_path: Option<&Path>,
    provider: Option<ProviderId>,
    strict: bool,
) -> Result<i32> {
    let mut config = load_workdir_config(workdir, config_path)?;
    if let Some(provider) = provider {
        config.set_provider(provider);
    }
    let adapter = Adapter::new(config.provider.id, config.provider.binary.as_deref());
    let help = CommandHelpReader {
        timeout: Duration::from_secs(config.provider.probe_timeout_secs),
    };
    let report = probe(&adapter, &help, strict || config.run.strict_capabilities)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize probe report")?
    );
    Ok(exit_codes::OK)
}

fn cmd_validate(plan_path: &Path) -> Result<i32> {
    ensure_schema()?;
    let loaded = load_plan(plan_path)?;
    let plan = &loaded.plan;
    if let Some(from) = loaded.migrated_from {
        println!(
            "plan uses schema version {from}; migrated to {} in memory (file unchanged)",
            plan.schema_version
        );
    }
    println!("{}", summarize(plan));
    Ok(exit_codes::OK)
}

fn summarize(plan: &Plan) -> String {
    let count = |status: StepStatus| plan.steps.iter().filter(|s| s.status == status).count();
    format!(
        "plan valid: {} steps ({} done, {} pending, {} in_progress, {} failed); iterations {}/{}",
        plan.steps.len(),
        count(StepStatus::Done),
        count(StepStatus::Pending),
        count(StepStatus::InProgress),
        count(StepStatus::Failed),
        plan.metadata.completed_iterations,
        plan.metadata.total_iterations,
    )
}

fn cmd_normalize(
    draft_path: &Path,
    goal: String,
    out: &Path,
    provider: ProviderId,
    model: Option<String>,
) -> Result<i32> {
    let raw = fs::read_to_string(draft_path)
        .with_context(|| format!("read draft {}", draft_path.display()))?;
    let draft: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse draft {}", draft_path.display()))?;
    let ctx = DraftContext {
        goal,
        provider: provider.as_str().to_string(),
        model: model.unwrap_or_else(|| provider.default_model().to_string()),
        created_at: Utc::now(),
    };
    let plan = normalize_draft(&ctx, &draft).map_err(|reason| anyhow!("invalid draft: {reason}"))?;
    let value = serde_json::to_value(&plan).context("serialize plan")?;
    parse_plan_value(value).map_err(|reason| anyhow!("normalized plan is invalid: {reason}"))?;
    save_plan(out, &plan)?;
    println!("wrote {} steps to {}", plan.steps.len(), out.display());
    Ok(exit_codes::OK)
}

fn load_workdir_config(workdir: &Path, explicit: Option<&Path>) -> Result<PlanrunConfig> {
    match explicit {
        Some(path) => {
            let path = workdir.join(path);
            if !path.exists() {
                return Err(anyhow!("config file {} not found", path.display()));
            }
            load_config(&path)
        }
        None => load_config(&workdir.join(CONFIG_FILE_NAME)),
    }
}
