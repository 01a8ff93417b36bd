//! Test-only fixtures and scripted collaborators.
//!
//! Compiled for unit tests and behind the `test-support` feature for the
//! integration tests in `tests/`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};

use crate::core::capabilities::{HelpProbe, Requirement};
use crate::core::types::{PostCheckResult, WorktreeState};
use crate::io::git::Worktree;
use crate::io::help::HelpReader;
use crate::io::plan_store::save_plan;
use crate::io::post_checks::{PostCheckRequest, PostCheckRunner};
use crate::plan::{CURRENT_SCHEMA_VERSION, Plan, RunMetadata, Step, StepStatus};
use crate::provider::{
    CommandSpec, Descriptor, EventSink, ExecRequest, ExecResult, Provider, ProviderId, StreamEvent,
};

/// A plan with a fixed timestamp and an iteration budget equal to the sum of
/// the steps' attempt budgets.
pub fn plan_with_steps(steps: Vec<Step>) -> Plan {
    let total_iterations = steps.iter().map(|step| step.max_attempts).sum();
    Plan {
        schema_version: CURRENT_SCHEMA_VERSION,
        goal: "Ship the feature".to_string(),
        created_at: Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("fixed timestamp"),
        steps,
        metadata: RunMetadata {
            provider: ProviderId::Codex.as_str().to_string(),
            model: ProviderId::Codex.default_model().to_string(),
            total_iterations,
            completed_iterations: 0,
            resume_session_id: None,
            resume_step_id: None,
        },
    }
}

/// A temporary working directory holding `plan` as `plan.json`.
pub fn workdir_with_plan(plan: &Plan) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    save_plan(&dir.path().join("plan.json"), plan).expect("save plan");
    dir
}

/// A pending step titled `"{id} title"`.
pub fn step(id: &str) -> Step {
    Step::new(id, format!("{id} title"))
}

/// A step with explicit status and attempt counters.
pub fn step_with(id: &str, status: StepStatus, attempts: u32, max_attempts: u32) -> Step {
    let mut step = step(id);
    step.status = status;
    step.attempts = attempts;
    step.max_attempts = max_attempts;
    step
}

/// A successful provider result.
pub fn ok_result(session_id: Option<&str>) -> ExecResult {
    ExecResult {
        ok: true,
        exit_code: Some(0),
        normalized_text: "step finished".to_string(),
        session_id: session_id.map(str::to_string),
        command: "scripted".to_string(),
        ..ExecResult::default()
    }
}

/// A provider result that exited with `exit_code`.
pub fn failed_result(exit_code: Option<i32>, session_id: Option<&str>) -> ExecResult {
    ExecResult {
        ok: false,
        exit_code,
        session_id: session_id.map(str::to_string),
        command: "scripted".to_string(),
        error: Some("scripted failure".to_string()),
        ..ExecResult::default()
    }
}

/// One scripted provider call: events delivered to the sink, then the result.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub events: Vec<StreamEvent>,
    pub result: ExecResult,
}

/// Provider that replays scripted calls and records every request.
pub struct ScriptedProvider {
    calls: RefCell<VecDeque<ScriptedCall>>,
    requests: RefCell<Vec<ExecRequest>>,
    spawn_error: Option<String>,
    touches: Option<String>,
    descriptor: Descriptor,
}

impl ScriptedProvider {
    pub fn new(results: Vec<ExecResult>) -> Self {
        Self::with_calls(
            results
                .into_iter()
                .map(|result| ScriptedCall {
                    events: Vec::new(),
                    result,
                })
                .collect(),
        )
    }

    pub fn with_calls(calls: Vec<ScriptedCall>) -> Self {
        Self {
            calls: RefCell::new(calls.into()),
            requests: RefCell::new(Vec::new()),
            spawn_error: None,
            touches: None,
            descriptor: Descriptor {
                id: ProviderId::Codex,
                display_name: "Scripted",
                cli_name: "scripted",
                supports_resume: true,
                supports_output_schema_path: false,
                supports_json_schema: false,
                supports_streaming_events: true,
            },
        }
    }

    /// Every call fails as if the binary could not be spawned.
    pub fn spawn_error(mut self, message: &str) -> Self {
        self.spawn_error = Some(message.to_string());
        self
    }

    /// Each call appends a line to `file` in the request's working directory,
    /// like an agent editing the tree.
    pub fn touching(mut self, file: &str) -> Self {
        self.touches = Some(file.to_string());
        self
    }

    pub fn without_resume(mut self) -> Self {
        self.descriptor.supports_resume = false;
        self
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }
}

impl Provider for ScriptedProvider {
    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn build_command(&self, request: &ExecRequest) -> CommandSpec {
        let mut args = vec!["--model".to_string(), request.model.clone()];
        if let Some(session) = request.resume_id() {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }
        CommandSpec {
            program: "scripted".to_string(),
            args,
            env: Vec::new(),
            stdin: Some(request.prompt.clone()),
            cwd: request.workdir.clone(),
        }
    }

    fn help_probes(&self) -> &'static [HelpProbe] {
        &[]
    }

    fn requirements(&self) -> &'static [Requirement] {
        &[]
    }

    fn program(&self) -> &str {
        "scripted"
    }

    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(message) = &self.spawn_error {
            return Err(anyhow!("spawn scripted: {message}"));
        }
        let call = self
            .calls
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider has no calls left"))?;
        if let Some(file) = &self.touches {
            let path = request.workdir.join(file);
            let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
            contents.push_str(&format!("edit {}\n", self.requests.borrow().len()));
            std::fs::write(&path, contents)?;
        }
        for event in call.events {
            sink(event);
        }
        Ok(call.result)
    }
}

/// Post-check runner returning queued exit codes; passes once the queue is empty.
#[derive(Default)]
pub struct ScriptedPostChecks {
    exit_codes: RefCell<VecDeque<i32>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedPostChecks {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn exit_codes(codes: &[i32]) -> Self {
        Self {
            exit_codes: RefCell::new(codes.iter().copied().collect()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl PostCheckRunner for ScriptedPostChecks {
    fn run(&self, command: &str, _request: &PostCheckRequest) -> Result<PostCheckResult> {
        self.commands.borrow_mut().push(command.to_string());
        let code = self.exit_codes.borrow_mut().pop_front().unwrap_or(0);
        Ok(PostCheckResult {
            command: command.to_string(),
            exit_code: Some(code),
            timed_out: false,
            output: format!("exit {code}"),
        })
    }
}

/// Worktree with a fixed state that records commit messages.
pub struct FakeWorktree {
    state: WorktreeState,
    fail_commits: bool,
    commits: RefCell<Vec<String>>,
}

impl FakeWorktree {
    pub fn new(state: WorktreeState) -> Self {
        Self {
            state,
            fail_commits: false,
            commits: RefCell::new(Vec::new()),
        }
    }

    pub fn clean() -> Self {
        Self::new(WorktreeState::Available { dirty: false })
    }

    pub fn failing_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.borrow().clone()
    }
}

impl Worktree for FakeWorktree {
    fn state(&self) -> WorktreeState {
        self.state.clone()
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        if self.fail_commits {
            return Err(anyhow!("git commit failed: index.lock exists"));
        }
        self.commits.borrow_mut().push(message.to_string());
        Ok(true)
    }
}

/// Help reader serving canned text per argument list.
#[derive(Default)]
pub struct StaticHelp {
    texts: HashMap<String, String>,
}

impl StaticHelp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, args: &[&str], text: &str) -> Self {
        self.texts.insert(args.join(" "), text.to_string());
        self
    }
}

impl HelpReader for StaticHelp {
    fn read_help(&self, program: &str, args: &[&str]) -> Result<String> {
        self.texts
            .get(&args.join(" "))
            .cloned()
            .ok_or_else(|| anyhow!("{program}: no help scripted for {args:?}"))
    }
}
