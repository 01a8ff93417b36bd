//! Capability probing: runs provider help invocations and matches tokens.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::capabilities::{ProbeReport, evaluate};
use crate::error::RunError;
use crate::io::process::run_command_with_timeout;
use crate::provider::Provider;

/// Help output is small; anything past this is noise.
const HELP_OUTPUT_LIMIT: usize = 256 * 1024;

/// Produces the help text for one invocation.
pub trait HelpReader {
    /// Concatenated stdout and stderr. `Err` when the program cannot be run.
    fn read_help(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Spawns the real CLI with a short timeout.
#[derive(Debug, Clone)]
pub struct CommandHelpReader {
    pub timeout: Duration,
}

impl HelpReader for CommandHelpReader {
    #[instrument(skip_all, fields(program = %program, args = ?args))]
    fn read_help(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, self.timeout, HELP_OUTPUT_LIMIT)?;
        if output.timed_out {
            warn!(program, "help invocation timed out");
        }
        let mut text = output.stdout_lossy();
        text.push('\n');
        text.push_str(&output.stderr_lossy());
        Ok(text)
    }
}

/// Probe `provider` once.
///
/// Missing required capabilities fail with [`RunError::CapabilityUnavailable`]
/// in strict mode and become warnings otherwise. A CLI that cannot be run
/// yields empty help text, so every requirement counts as missing.
pub fn probe<P: Provider + ?Sized, H: HelpReader>(
    provider: &P,
    reader: &H,
    strict: bool,
) -> Result<ProbeReport> {
    let descriptor = provider.descriptor();
    let texts: Vec<String> = provider
        .help_probes()
        .iter()
        .map(|probe| {
            reader
                .read_help(provider.program(), probe.args)
                .unwrap_or_else(|err| {
                    warn!(
                        provider = descriptor.id.as_str(),
                        err = %format!("{err:#}"),
                        "help probe failed"
                    );
                    String::new()
                })
        })
        .collect();

    let mut report = evaluate(
        descriptor.static_support(),
        provider.requirements(),
        &texts,
    );
    debug!(
        provider = descriptor.id.as_str(),
        fatal = report.fatal_missing.len(),
        warnings = report.warnings.len(),
        "capability probe finished"
    );

    if !report.fatal_missing.is_empty() {
        if strict {
            return Err(RunError::CapabilityUnavailable {
                provider: descriptor.id.to_string(),
                missing: report.fatal_missing.clone(),
            }
            .into());
        }
        let degraded: Vec<String> = report
            .fatal_missing
            .iter()
            .map(|name| {
                format!("required capability {name} not detected; continuing because strict mode is off")
            })
            .collect();
        report.warnings.extend(degraded);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Adapter, ProviderId};
    use crate::test_support::StaticHelp;

    const CODEX_TOP: &str = "Codex CLI\n\nCommands:\n  exec    Run Codex non-interactively\n";
    const CODEX_EXEC: &str = "Usage: codex exec [OPTIONS] [PROMPT] [COMMAND]\n\nCommands:\n  resume  Resume a previous session\n\nOptions:\n  -m, --model <MODEL>\n      --json\n      --output-schema <FILE>\n";

    #[test]
    fn full_help_has_nothing_missing() {
        let codex = Adapter::new(ProviderId::Codex, None);
        let help = StaticHelp::new()
            .with(&["--help"], CODEX_TOP)
            .with(&["exec", "--help"], CODEX_EXEC);
        let report = probe(&codex, &help, true).expect("probe");
        assert!(report.fatal_missing.is_empty());
        assert!(report.warnings.is_empty());
        assert!(report.supports_resume);
        assert!(report.supports_output_schema_path);
    }

    #[test]
    fn strict_mode_fails_on_missing_required_token() {
        let codex = Adapter::new(ProviderId::Codex, None);
        let help = StaticHelp::new()
            .with(&["--help"], CODEX_TOP)
            .with(&["exec", "--help"], "Usage: codex exec\n  -m, --model <MODEL>\n");
        let err = probe(&codex, &help, true).expect_err("strict");
        match err.downcast_ref::<RunError>() {
            Some(RunError::CapabilityUnavailable { provider, missing }) => {
                assert_eq!(provider, "codex");
                assert_eq!(missing, &vec!["exec --json".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lenient_mode_turns_missing_into_warnings() {
        let gemini = Adapter::new(ProviderId::Gemini, None);
        let report = probe(&gemini, &StaticHelp::new(), false).expect("probe");
        assert_eq!(report.fatal_missing.len(), 1);
        assert!(report.warnings[0].contains("strict mode is off"));
    }

    #[cfg(unix)]
    #[test]
    fn command_reader_concatenates_streams() {
        let reader = CommandHelpReader {
            timeout: Duration::from_secs(10),
        };
        let text = reader
            .read_help("sh", &["-c", "echo --out; echo --err >&2"])
            .expect("help");
        assert!(text.contains("--out"));
        assert!(text.contains("--err"));
    }
}
