//! `claude -p` adapter, the streaming provider.
//!
//! `--output-format stream-json --verbose` prints one JSON record per line
//! while the agent works: `system/init` (session id), `assistant` content
//! blocks, `user` tool results and a final `result`. Lines are consumed as
//! they arrive so a silent process can be killed after the stall window.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::capabilities::{Capability, HelpProbe, Requirement};
use crate::io::process::{LineControl, run_command_streaming};
use crate::provider::stream::looks_like_api_error;
use crate::provider::{
    CommandSpec, Descriptor, EventKind, EventSink, ExecRequest, ExecResult, Provider, ProviderId,
    ReasoningEffort, StreamEvent, process_error,
};

const PROBES: [HelpProbe; 1] = [HelpProbe { args: &["--help"] }];

const REQUIREMENTS: [Requirement; 3] = [
    Requirement {
        name: "--print stream-json",
        probe: 0,
        tokens: &["--print", "--output-format", "stream-json", "--verbose", "--model"],
        capability: None,
    },
    Requirement {
        name: "--resume",
        probe: 0,
        tokens: &["--resume"],
        capability: Some(Capability::Resume),
    },
    Requirement {
        name: "--json-schema",
        probe: 0,
        tokens: &["--json-schema"],
        capability: Some(Capability::JsonSchema),
    },
];

/// Env var controlling the extended-thinking budget.
pub const THINKING_ENV: &str = "MAX_THINKING_TOKENS";

pub fn thinking_tokens(effort: ReasoningEffort) -> u32 {
    match effort {
        ReasoningEffort::Low => 4_000,
        ReasoningEffort::Medium => 10_000,
        ReasoningEffort::High => 31_999,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claude {
    program: String,
}

impl Claude {
    pub fn new(program: Option<&str>) -> Self {
        Self {
            program: program.unwrap_or("claude").to_string(),
        }
    }
}

impl Provider for Claude {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            id: ProviderId::Claude,
            display_name: "Claude Code",
            cli_name: "claude",
            supports_resume: true,
            supports_output_schema_path: false,
            supports_json_schema: true,
            supports_streaming_events: true,
        }
    }

    fn build_command(&self, request: &ExecRequest) -> CommandSpec {
        let mut args: Vec<String> = vec![
            "-p".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--model".into(),
            request.model.clone(),
            "--dangerously-skip-permissions".into(),
        ];
        if let Some(session) = request.resume_id() {
            args.push("--resume".into());
            args.push(session.to_string());
        }
        if let Some(schema) = &request.output_schema {
            args.push("--json-schema".into());
            args.push(schema.value.to_string());
        }

        CommandSpec {
            program: self.program.clone(),
            args,
            env: vec![(
                THINKING_ENV.to_string(),
                thinking_tokens(request.reasoning).to_string(),
            )],
            stdin: Some(request.prompt.clone()),
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

    #[instrument(skip_all, fields(provider = "claude", timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult> {
        let spec = self.build_command(request);
        info!(workdir = %request.workdir.display(), "starting claude");

        let mut stream = ClaudeStream::default();
        let output = run_command_streaming(
            spec.to_command(),
            spec.stdin.as_deref().map(str::as_bytes),
            request.timeout,
            request.stall_timeout,
            request.output_limit_bytes,
            |line| {
                let step = stream.handle_line(line);
                for event in step.events {
                    sink(event);
                }
                match step.abort {
                    Some(reason) => LineControl::Abort(reason),
                    None => LineControl::Continue,
                }
            },
        )
        .context("run claude")?;

        let mut error = process_error(&output, request);
        if error.is_none() {
            error = stream.result_error.clone();
        }
        let ok = output.success() && stream.result_error.is_none();
        if ok {
            debug!("claude completed successfully");
        } else {
            warn!(exit_code = ?output.status.code(), stalled = output.stalled, "claude failed");
        }

        Ok(ExecResult {
            ok,
            exit_code: output.status.code(),
            timed_out: output.timed_out || output.stalled,
            raw_output: output.stdout_lossy(),
            normalized_text: stream.final_text(),
            session_id: stream.session_id,
            command: spec.display(),
            error,
        })
    }
}

/// Events parsed from one line, plus whether to stop the process.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineStep {
    pub events: Vec<StreamEvent>,
    pub abort: Option<String>,
}

/// Incremental parser state for a `stream-json` transcript.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClaudeStream {
    pub session_id: Option<String>,
    pub result_text: Option<String>,
    pub result_error: Option<String>,
    last_text: String,
}

impl ClaudeStream {
    pub fn handle_line(&mut self, line: &str) -> LineStep {
        let mut step = LineStep::default();
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            return step;
        };
        if let Some(id) = value["session_id"].as_str() {
            self.session_id = Some(id.to_string());
        }

        match value["type"].as_str().unwrap_or_default() {
            "assistant" => {
                for block in content_blocks(&value) {
                    match block["type"].as_str().unwrap_or_default() {
                        "text" => {
                            let text = block["text"].as_str().unwrap_or_default();
                            if looks_like_api_error(text) {
                                step.abort =
                                    Some(format!("provider returned an API error body: {}", text.trim()));
                            }
                            self.last_text = text.to_string();
                            step.events
                                .push(StreamEvent::new(EventKind::AssistantText, text));
                        }
                        "thinking" => step.events.push(StreamEvent::new(
                            EventKind::Thinking,
                            block["thinking"].as_str().unwrap_or_default(),
                        )),
                        "tool_use" => step.events.push(StreamEvent::tool_call(
                            block["name"].as_str().unwrap_or("tool"),
                            block["input"].to_string(),
                        )),
                        _ => {}
                    }
                }
            }
            "user" => {
                for block in content_blocks(&value) {
                    if block["type"] == "tool_result" {
                        step.events.push(StreamEvent::tool_result(
                            tool_result_text(&block["content"]),
                            block["is_error"].as_bool().unwrap_or(false),
                        ));
                    }
                }
            }
            "result" => {
                let text = value["result"].as_str().map(str::to_string);
                if value["is_error"].as_bool().unwrap_or(false) {
                    self.result_error = Some(text.clone().unwrap_or_else(|| {
                        value["subtype"].as_str().unwrap_or("error").to_string()
                    }));
                }
                self.result_text = text;
            }
            _ => {}
        }
        step
    }

    /// Final result text, or the last assistant message if no result arrived.
    pub fn final_text(&self) -> String {
        self.result_text
            .clone()
            .unwrap_or_else(|| self.last_text.clone())
    }
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value["message"]["content"]
        .as_array()
        .into_iter()
        .flatten()
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SessionStrategy, fixtures};

    #[test]
    fn command_uses_stream_json_and_thinking_env() {
        let spec = Claude::new(None).build_command(&fixtures::request());
        assert_eq!(spec.program, "claude");
        assert_eq!(
            spec.args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "test-model",
                "--dangerously-skip-permissions",
            ]
        );
        assert_eq!(
            spec.env,
            vec![(THINKING_ENV.to_string(), "31999".to_string())]
        );
        assert_eq!(spec.stdin.as_deref(), Some("do the step"));
    }

    #[test]
    fn resume_and_inline_schema_are_forwarded() {
        let mut request = fixtures::with_schema();
        request.session = SessionStrategy::Resume;
        request.resume_session_id = Some("sess-9".to_string());
        let args = Claude::new(None).build_command(&request).args;
        let tail: Vec<&str> = args.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["--resume", "sess-9", "--json-schema", r#"{"type":"object"}"#]);
    }

    #[test]
    fn stream_records_map_to_events() {
        let mut stream = ClaudeStream::default();
        stream.handle_line(r#"{"type":"system","subtype":"init","session_id":"s-1","tools":[]}"#);
        let assistant = stream.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Running tests"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"cargo test"}}]},"session_id":"s-1"}"#,
        );
        let kinds: Vec<EventKind> = assistant.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Thinking, EventKind::AssistantText, EventKind::ToolCall]
        );
        assert_eq!(assistant.events[2].tool.as_deref(), Some("Bash"));
        assert_eq!(assistant.abort, None);

        let user = stream.handle_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"test result: ok"}],"is_error":false}]}}"#,
        );
        assert_eq!(user.events, vec![StreamEvent::tool_result("test result: ok", false)]);

        stream.handle_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"All done","session_id":"s-1"}"#,
        );
        assert_eq!(stream.session_id.as_deref(), Some("s-1"));
        assert_eq!(stream.final_text(), "All done");
        assert_eq!(stream.result_error, None);
    }

    #[test]
    fn api_error_text_aborts() {
        let mut stream = ClaudeStream::default();
        let step = stream.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"{\"error\":{\"code\":529,\"message\":\"Overloaded\"}}"}]}}"#,
        );
        let reason = step.abort.expect("abort");
        assert!(reason.contains("Overloaded"));
    }

    #[test]
    fn error_result_is_recorded() {
        let mut stream = ClaudeStream::default();
        stream.handle_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        assert_eq!(stream.result_error.as_deref(), Some("error_max_turns"));
    }

    #[cfg(unix)]
    mod fake_binary {
        use std::time::{Duration, Instant};

        use crate::core::classifier::{ProviderVerdict, classify};
        use crate::core::types::{AttemptOutcome, FailureKind};
        use crate::provider::{Adapter, EventKind, Provider, ProviderId, StreamEvent, fixtures};

        const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"s-fake"}"#;

        #[test]
        fn silence_after_init_is_a_timeout() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fixtures::fake_cli(
                dir.path(),
                &format!("cat >/dev/null\necho '{INIT}'\nsleep 30"),
            );
            let mut request = fixtures::request_in(dir.path());
            request.stall_timeout = Duration::from_millis(300);

            let started = Instant::now();
            let result = Adapter::new(ProviderId::Claude, Some(cli.as_str()))
                .execute(&request, &mut |_: StreamEvent| {})
                .expect("execute");
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!result.ok);
            assert!(result.timed_out);
            assert_eq!(result.session_id.as_deref(), Some("s-fake"));
            assert!(result.error.as_deref().expect("error").contains("stalled"));

            let outcome = classify(
                &ProviderVerdict {
                    ok: result.ok,
                    timed_out: result.timed_out,
                    exit_code: result.exit_code,
                    error: result.error.as_deref(),
                },
                &[],
            );
            assert!(matches!(
                outcome,
                AttemptOutcome::Failed(failure) if failure.kind == FailureKind::Timeout
            ));
        }

        #[test]
        fn api_error_text_stops_the_process() {
            let dir = tempfile::tempdir().expect("tempdir");
            let body = format!(
                "cat >/dev/null\necho '{INIT}'\nprintf '%s\\n' '{}'\nsleep 30",
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"{\"error\":{\"code\":429,\"message\":\"x\"}}"}]}}"#
            );
            let cli = fixtures::fake_cli(dir.path(), &body);
            let request = fixtures::request_in(dir.path());

            let mut kinds = Vec::new();
            let started = Instant::now();
            let result = Adapter::new(ProviderId::Claude, Some(cli.as_str()))
                .execute(&request, &mut |event: StreamEvent| kinds.push(event.kind))
                .expect("execute");
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!result.ok);
            assert!(!result.timed_out);
            assert!(
                result.error.as_deref().expect("error").contains("API error"),
                "{:?}",
                result.error
            );
            assert_eq!(kinds, vec![EventKind::AssistantText]);
        }
    }

    #[test]
    fn effort_maps_to_thinking_budget() {
        assert_eq!(thinking_tokens(ReasoningEffort::Low), 4_000);
        assert_eq!(thinking_tokens(ReasoningEffort::Medium), 10_000);
    }
}
