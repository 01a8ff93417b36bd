//! Uniform execution interface over the supported agent CLIs.
//!
//! Each CLI gets one adapter module. [`Provider::build_command`] is pure so
//! argv/env/stdin can be asserted in tests; [`Provider::execute`] spawns the
//! process through [`crate::io::process`]. [`Adapter`] is the tagged variant
//! the binary dispatches on; tests substitute scripted providers.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::capabilities::{HelpProbe, Requirement, StaticSupport};
use crate::io::process::CommandOutput;

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod stream;

pub use stream::{EventKind, StreamEvent};

/// Arguments longer than this are elided in rendered commands.
const DISPLAY_ARG_LIMIT: usize = 160;

/// Stderr kept in a failure detail.
const ERROR_TAIL_BYTES: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[default]
    Codex,
    Claude,
    Gemini,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Codex, ProviderId::Claude, ProviderId::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Codex => "codex",
            ProviderId::Claude => "claude",
            ProviderId::Gemini => "gemini",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderId::Codex => "gpt-5-codex",
            ProviderId::Claude => "claude-sonnet-4-5",
            ProviderId::Gemini => "gemini-2.5-pro",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown provider '{s}' (expected codex, claude or gemini)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => Err(format!(
                "unknown reasoning effort '{other}' (expected low, medium or high)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    New,
    Resume,
}

/// JSON Schema constraining the agent's final message.
///
/// Path-based CLIs read `path`; inline CLIs receive `value` serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub path: PathBuf,
    pub value: serde_json::Value,
}

/// Everything an adapter needs for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub model: String,
    pub reasoning: ReasoningEffort,
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Streaming adapters only.
    pub stall_timeout: Duration,
    pub output_limit_bytes: usize,
    pub session: SessionStrategy,
    pub resume_session_id: Option<String>,
    pub output_schema: Option<OutputSchema>,
}

impl ExecRequest {
    /// Session id to pass, if this call resumes one.
    pub fn resume_id(&self) -> Option<&str> {
        match self.session {
            SessionStrategy::Resume => self.resume_session_id.as_deref(),
            SessionStrategy::New => None,
        }
    }
}

/// Normalized outcome of one provider call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExecResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub raw_output: String,
    pub normalized_text: String,
    pub session_id: Option<String>,
    pub command: String,
    pub error: Option<String>,
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Shell-like rendering for logs; long arguments are elided.
    pub fn display(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.env {
            out.push_str(&format!("{key}={} ", quote(value)));
        }
        out.push_str(&quote(&self.program));
        for arg in &self.args {
            out.push(' ');
            if arg.len() > DISPLAY_ARG_LIMIT {
                out.push_str(&format!("<{} bytes>", arg.len()));
            } else {
                out.push_str(&quote(arg));
            }
        }
        if let Some(stdin) = &self.stdin {
            out.push_str(&format!(" < <{} bytes>", stdin.len()));
        }
        out
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Static facts about an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub cli_name: &'static str,
    pub supports_resume: bool,
    pub supports_output_schema_path: bool,
    pub supports_json_schema: bool,
    pub supports_streaming_events: bool,
}

impl Descriptor {
    pub fn static_support(&self) -> StaticSupport {
        StaticSupport {
            resume: self.supports_resume,
            output_schema_path: self.supports_output_schema_path,
            json_schema: self.supports_json_schema,
        }
    }
}

/// Receives provider events as they are parsed.
pub type EventSink<'a> = dyn FnMut(StreamEvent) + 'a;

/// Abstraction over agent CLI backends.
pub trait Provider {
    fn descriptor(&self) -> Descriptor;

    /// Pure: identical requests produce identical specs.
    fn build_command(&self, request: &ExecRequest) -> CommandSpec;

    /// Help invocations run by the capability prober.
    fn help_probes(&self) -> &'static [HelpProbe];

    /// Token sets checked against the probe output.
    fn requirements(&self) -> &'static [Requirement];

    /// Program used for help probes.
    fn program(&self) -> &str;

    /// Run one call. `Err` means the process could not be run at all.
    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult>;
}

/// The built-in adapters as one tagged variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adapter {
    Codex(codex::Codex),
    Claude(claude::Claude),
    Gemini(gemini::Gemini),
}

impl Adapter {
    /// Adapter for `id`, optionally running a different binary.
    pub fn new(id: ProviderId, program: Option<&str>) -> Self {
        match id {
            ProviderId::Codex => Adapter::Codex(codex::Codex::new(program)),
            ProviderId::Claude => Adapter::Claude(claude::Claude::new(program)),
            ProviderId::Gemini => Adapter::Gemini(gemini::Gemini::new(program)),
        }
    }

    fn inner(&self) -> &dyn Provider {
        match self {
            Adapter::Codex(p) => p,
            Adapter::Claude(p) => p,
            Adapter::Gemini(p) => p,
        }
    }
}

impl Provider for Adapter {
    fn descriptor(&self) -> Descriptor {
        self.inner().descriptor()
    }

    fn build_command(&self, request: &ExecRequest) -> CommandSpec {
        self.inner().build_command(request)
    }

    fn help_probes(&self) -> &'static [HelpProbe] {
        self.inner().help_probes()
    }

    fn requirements(&self) -> &'static [Requirement] {
        self.inner().requirements()
    }

    fn program(&self) -> &str {
        self.inner().program()
    }

    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult> {
        self.inner().execute(request, sink)
    }
}

/// Failure detail for a finished process, if it failed.
pub(crate) fn process_error(output: &CommandOutput, request: &ExecRequest) -> Option<String> {
    if let Some(reason) = &output.aborted {
        return Some(reason.clone());
    }
    if output.stalled {
        return Some(format!(
            "no output for {}s (stalled)",
            request.stall_timeout.as_secs()
        ));
    }
    if output.timed_out {
        return Some(format!("timed out after {}s", request.timeout.as_secs()));
    }
    if output.status.success() {
        return None;
    }
    let stderr = output.stderr_lossy();
    let tail = tail(stderr.trim(), ERROR_TAIL_BYTES);
    Some(if tail.is_empty() {
        "no stderr output".to_string()
    } else {
        tail.to_string()
    })
}

/// Last `max` bytes of `text`, on a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_parse_and_display() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>(), Ok(id));
            assert_eq!(id.to_string(), id.as_str());
        }
        assert!("copilot".parse::<ProviderId>().is_err());
    }

    #[test]
    fn display_quotes_and_elides() {
        let spec = CommandSpec {
            program: "gemini".to_string(),
            args: vec![
                "--model".to_string(),
                "m 1".to_string(),
                "x".repeat(DISPLAY_ARG_LIMIT + 1),
            ],
            env: vec![("MAX_THINKING_TOKENS".to_string(), "4000".to_string())],
            stdin: Some("prompt".to_string()),
            cwd: PathBuf::from("/work"),
        };
        assert_eq!(
            spec.display(),
            format!(
                "MAX_THINKING_TOKENS=4000 gemini --model 'm 1' <{} bytes> < <6 bytes>",
                DISPLAY_ARG_LIMIT + 1
            )
        );
    }

    #[test]
    fn resume_id_requires_resume_strategy() {
        let mut request = fixtures::resumed("abc");
        assert_eq!(request.resume_id(), Some("abc"));
        request.session = SessionStrategy::New;
        assert_eq!(request.resume_id(), None);
    }

    #[test]
    fn adapters_report_their_ids() {
        for id in ProviderId::ALL {
            assert_eq!(Adapter::new(id, None).descriptor().id, id);
        }
        assert_eq!(Adapter::new(ProviderId::Claude, Some("/tmp/fake")).program(), "/tmp/fake");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 3), "é");
    }
}
