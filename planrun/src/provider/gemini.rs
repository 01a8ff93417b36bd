//! `gemini` adapter.
//!
//! Gemini takes the prompt as an argument and prints a single JSON body
//! (`response`, `session_id`, `error`) once it finishes. It has no resume,
//! schema, or reasoning-effort flags.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::capabilities::{HelpProbe, Requirement};
use crate::io::process::run_command_with_timeout;
use crate::provider::{
    CommandSpec, Descriptor, EventKind, EventSink, ExecRequest, ExecResult, Provider, ProviderId,
    StreamEvent, process_error,
};

const PROBES: [HelpProbe; 1] = [HelpProbe { args: &["--help"] }];

const REQUIREMENTS: [Requirement; 1] = [Requirement {
    name: "--output-format json --prompt --yolo",
    probe: 0,
    tokens: &["--output-format", "--prompt", "--yolo", "--model"],
    capability: None,
}];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gemini {
    program: String,
}

impl Gemini {
    pub fn new(program: Option<&str>) -> Self {
        Self {
            program: program.unwrap_or("gemini").to_string(),
        }
    }
}

impl Provider for Gemini {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            id: ProviderId::Gemini,
            display_name: "Gemini CLI",
            cli_name: "gemini",
            supports_resume: false,
            supports_output_schema_path: false,
            supports_json_schema: false,
            supports_streaming_events: false,
        }
    }

    fn build_command(&self, request: &ExecRequest) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: vec![
                "--output-format".into(),
                "json".into(),
                "--model".into(),
                request.model.clone(),
                "--yolo".into(),
                "--prompt".into(),
                request.prompt.clone(),
            ],
            env: Vec::new(),
            stdin: None,
            cwd: request.workdir.clone(),
        }
    }

    fn help_probes(&self) -> &'static [HelpProbe] {
        &PROBES
    }

    fn requirements(&self) -> &'static [Requirement] {
        &REQUIREMENTS
    }

    fn program(&self) -> &str {
        &self.program
    }

    #[instrument(skip_all, fields(provider = "gemini", timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult> {
        let spec = self.build_command(request);
        info!(workdir = %request.workdir.display(), "starting gemini");
        let output = run_command_with_timeout(
            spec.to_command(),
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run gemini")?;

        let raw = output.stdout_lossy();
        let body = parse_body(&raw);
        if !body.response.is_empty() {
            sink(StreamEvent::new(EventKind::AssistantText, body.response.clone()));
        }

        let mut error = process_error(&output, request);
        if error.is_none() {
            error = body.error.clone();
        }
        let ok = output.success() && body.error.is_none();
        if ok {
            debug!("gemini completed successfully");
        } else {
            warn!(exit_code = ?output.status.code(), "gemini failed");
        }

        Ok(ExecResult {
            ok,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            raw_output: raw,
            normalized_text: body.response,
            session_id: body.session_id,
            command: spec.display(),
            error,
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GeminiBody {
    pub response: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

/// Parse the JSON body; stray log lines around it are skipped.
///
/// Output that holds no JSON object is taken as plain response text.
pub fn parse_body(raw: &str) -> GeminiBody {
    let value = serde_json::from_str::<Value>(raw.trim()).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        (start < end)
            .then(|| serde_json::from_str::<Value>(&raw[start..=end]).ok())
            .flatten()
    });
    let Some(value) = value.filter(Value::is_object) else {
        return GeminiBody {
            response: raw.trim().to_string(),
            ..GeminiBody::default()
        };
    };

    let error = match &value["error"] {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(
            other["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    };
    GeminiBody {
        response: value["response"].as_str().unwrap_or_default().to_string(),
        session_id: value["session_id"]
            .as_str()
            .or_else(|| value["sessionId"].as_str())
            .map(str::to_string),
        error,
    }
}
