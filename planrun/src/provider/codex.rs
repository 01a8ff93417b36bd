//! `codex exec` adapter.
//!
//! The prompt goes in on stdin (`-`). With `--json` codex prints one JSON
//! event per line: `thread.started` carries the session id and
//! `item.completed` items carry reasoning, commands and the agent's messages.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::capabilities::{Capability, HelpProbe, Requirement};
use crate::io::process::run_command_with_timeout;
use crate::provider::{
    CommandSpec, Descriptor, EventKind, EventSink, ExecRequest, ExecResult, Provider, ProviderId,
    StreamEvent, process_error,
};

const PROBES: [HelpProbe; 2] = [
    HelpProbe { args: &["--help"] },
    HelpProbe {
        args: &["exec", "--help"],
    },
];

const REQUIREMENTS: [Requirement; 4] = [
    Requirement {
        name: "exec subcommand",
        probe: 0,
        tokens: &["exec"],
        capability: None,
    },
    Requirement {
        name: "exec --json",
        probe: 1,
        tokens: &["--json", "--model"],
        capability: None,
    },
    Requirement {
        name: "exec resume",
        probe: 1,
        tokens: &["resume"],
        capability: Some(Capability::Resume),
    },
    Requirement {
        name: "exec --output-schema",
        probe: 1,
        tokens: &["--output-schema"],
        capability: Some(Capability::OutputSchemaPath),
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codex {
    program: String,
}

impl Codex {
    pub fn new(program: Option<&str>) -> Self {
        Self {
            program: program.unwrap_or("codex").to_string(),
        }
    }
}

impl Provider for Codex {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            id: ProviderId::Codex,
            display_name: "OpenAI Codex CLI",
            cli_name: "codex",
            supports_resume: true,
            supports_output_schema_path: true,
            supports_json_schema: false,
            supports_streaming_events: false,
        }
    }

    fn build_command(&self, request: &ExecRequest) -> CommandSpec {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--json".into(),
            "--skip-git-repo-check".into(),
            "--sandbox".into(),
            "danger-full-access".into(),
            "--model".into(),
            request.model.clone(),
            "-c".into(),
            format!("model_reasoning_effort={}", request.reasoning.as_str()),
        ];
        if let Some(schema) = &request.output_schema {
            args.push("--output-schema".into());
            args.push(schema.path.display().to_string());
        }
        if let Some(session) = request.resume_id() {
            args.push("resume".into());
            args.push(session.to_string());
        }
        args.push("-".into());

        CommandSpec {
            program: self.program.clone(),
            args,
            env: Vec::new(),
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

    #[instrument(skip_all, fields(provider = "codex", timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest, sink: &mut EventSink<'_>) -> Result<ExecResult> {
        let spec = self.build_command(request);
        info!(workdir = %request.workdir.display(), "starting codex exec");
        let output = run_command_with_timeout(
            spec.to_command(),
            spec.stdin.as_deref().map(str::as_bytes),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run codex exec")?;

        let raw = output.stdout_lossy();
        let parsed = parse_output(&raw);
        for event in parsed.events {
            sink(event);
        }

        let mut error = process_error(&output, request);
        if error.is_none() {
            error = parsed.failure.clone();
        }
        let ok = output.success() && parsed.failure.is_none();
        if ok {
            debug!("codex exec completed successfully");
        } else {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
        }

        Ok(ExecResult {
            ok,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            raw_output: raw,
            normalized_text: parsed.text,
            session_id: parsed.session_id,
            command: spec.display(),
            error,
        })
    }
}

/// What the codex JSONL stream contained.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CodexOutput {
    pub session_id: Option<String>,
    /// Last agent message.
    pub text: String,
    pub events: Vec<StreamEvent>,
    /// `turn.failed` or top-level `error` message.
    pub failure: Option<String>,
}

/// Parse `codex exec --json` output; non-JSON lines are ignored.
pub fn parse_output(raw: &str) -> CodexOutput {
    let mut out = CodexOutput::default();
    for line in raw.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        match value["type"].as_str().unwrap_or_default() {
            "thread.started" => {
                if let Some(id) = value["thread_id"].as_str() {
                    out.session_id = Some(id.to_string());
                }
            }
            "item.completed" => parse_item(&value["item"], &mut out),
            "turn.failed" => {
                out.failure = Some(
                    value["error"]["message"]
                        .as_str()
                        .unwrap_or("turn failed")
                        .to_string(),
                );
            }
            "error" => {
                out.failure = Some(
                    value["message"]
                        .as_str()
                        .unwrap_or("codex reported an error")
                        .to_string(),
                );
            }
            _ => {}
        }
    }
    out
}

fn parse_item(item: &Value, out: &mut CodexOutput) {
    let text = |key: &str| item[key].as_str().unwrap_or_default().to_string();
    match item["type"].as_str().unwrap_or_default() {
        "agent_message" => {
            out.text = text("text");
            out.events
                .push(StreamEvent::new(EventKind::AssistantText, text("text")));
        }
        "reasoning" => out
            .events
            .push(StreamEvent::new(EventKind::Thinking, text("text"))),
        "command_execution" => {
            out.events
                .push(StreamEvent::tool_call("shell", text("command")));
            let failed = item["exit_code"].as_i64().is_some_and(|code| code != 0);
            out.events
                .push(StreamEvent::tool_result(text("aggregated_output"), failed));
        }
        "file_change" => {
            let paths: Vec<&str> = item["changes"]
                .as_array()
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|change| change["path"].as_str())
                        .collect()
                })
                .unwrap_or_default();
            out.events
                .push(StreamEvent::tool_call("apply_patch", paths.join(", ")));
        }
        "mcp_tool_call" => out.events.push(StreamEvent::tool_call(
            text("tool"),
            item["arguments"].to_string(),
        )),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SessionStrategy, fixtures};

    #[test]
    fn fresh_command_reads_prompt_from_stdin() {
        let spec = Codex::new(None).build_command(&fixtures::request());
        assert_eq!(spec.program, "codex");
        assert_eq!(
            spec.args,
            vec![
                "exec",
                "--json",
                "--skip-git-repo-check",
                "--sandbox",
                "danger-full-access",
                "--model",
                "test-model",
                "-c",
                "model_reasoning_effort=high",
                "-",
            ]
        );
        assert_eq!(spec.stdin.as_deref(), Some("do the step"));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn resume_and_schema_are_forwarded() {
        let mut request = fixtures::with_schema();
        request.session = SessionStrategy::Resume;
        request.resume_session_id = Some("thr_1".to_string());
        let args = Codex::new(None).build_command(&request).args;
        let tail: Vec<&str> = args.iter().rev().take(5).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "--output-schema",
                "/work/.planrun/step-report.schema.json",
                "resume",
                "thr_1",
                "-"
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_after_jsonl_fails_the_call() {
        use crate::provider::Adapter;

        let dir = tempfile::tempdir().expect("tempdir");
        let cli = fixtures::fake_cli(
            dir.path(),
            concat!(
                "cat >/dev/null\n",
                r#"echo '{"type":"thread.started","thread_id":"thr_fake"}'"#,
                "\n",
                r#"echo '{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"half done"}}'"#,
                "\n",
                "echo 'codex crashed' >&2\n",
                "exit 1",
            ),
        );

        let mut events = Vec::new();
        let result = Adapter::new(ProviderId::Codex, Some(cli.as_str()))
            .execute(&fixtures::request_in(dir.path()), &mut |event: StreamEvent| {
                events.push(event);
            })
            .expect("execute");
        assert!(!result.ok);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.session_id.as_deref(), Some("thr_fake"));
        assert_eq!(result.normalized_text, "half done");
        assert_eq!(result.error.as_deref(), Some("codex crashed"));
        assert_eq!(events, vec![StreamEvent::new(EventKind::AssistantText, "half done")]);
    }

    #[test]
    fn build_command_is_deterministic() {
        let codex = Codex::new(None);
        let request = fixtures::with_schema();
        assert_eq!(codex.build_command(&request), codex.build_command(&request));
    }

    #[test]
    fn parses_session_messages_and_commands() {
        let raw = [
            r#"{"type":"thread.started","thread_id":"0199-abc"}"#,
            r#"{"type":"turn.started"}"#,
            r#"{"type":"item.completed","item":{"id":"item_0","type":"reasoning","text":"planning"}}"#,
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"cargo test","aggregated_output":"ok","exit_code":0,"status":"completed"}}"#,
            "not json",
            r#"{"type":"item.completed","item":{"id":"item_2","type":"agent_message","text":"{\"status\":\"done\"}"}}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":10}}"#,
        ]
        .join("\n");

        let out = parse_output(&raw);
        assert_eq!(out.session_id.as_deref(), Some("0199-abc"));
        assert_eq!(out.text, r#"{"status":"done"}"#);
        assert_eq!(out.failure, None);
        let kinds: Vec<EventKind> = out.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Thinking,
                EventKind::ToolCall,
                EventKind::ToolResult,
                EventKind::AssistantText
            ]
        );
    }

    #[test]
    fn turn_failure_is_reported() {
        let out = parse_output(r#"{"type":"turn.failed","error":{"message":"usage limit"}}"#);
        assert_eq!(out.failure.as_deref(), Some("usage limit"));
    }
}
