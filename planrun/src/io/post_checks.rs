//! Post-check runner: shell commands that must pass after a step.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::PostCheckResult;
use crate::io::process::run_command_with_timeout;
use crate::provider::tail;

/// Output tail kept on each result.
const OUTPUT_TAIL_BYTES: usize = 2_000;

#[derive(Debug, Clone)]
pub struct PostCheckRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait PostCheckRunner {
    fn run(&self, command: &str, request: &PostCheckRequest) -> Result<PostCheckResult>;
}

/// Runs each check as `sh -c <command>` in the working directory.
pub struct ShellPostChecks;

impl PostCheckRunner for ShellPostChecks {
    #[instrument(skip_all, fields(command = %command))]
    fn run(&self, command: &str, request: &PostCheckRequest) -> Result<PostCheckResult> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&request.workdir);
        let output =
            run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
                .with_context(|| format!("run post-check `{command}`"))?;

        let mut combined = output.stdout_lossy();
        combined.push_str(&output.stderr_lossy());
        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "post-check finished");
        Ok(PostCheckResult {
            command: command.to_string(),
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            timed_out: output.timed_out,
            output: tail(combined.trim(), OUTPUT_TAIL_BYTES).to_string(),
        })
    }
}

/// Run `commands` in order, stopping after the first failure.
///
/// A check that cannot be spawned is reported as a failed result rather than
/// an error, so it is retried like any other failing check.
pub fn run_post_checks<R: PostCheckRunner>(
    runner: &R,
    commands: &[String],
    request: &PostCheckRequest,
) -> Vec<PostCheckResult> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let result = runner.run(command, request).unwrap_or_else(|err| {
            warn!(command = %command, err = %format!("{err:#}"), "post-check could not run");
            PostCheckResult {
                command: command.clone(),
                exit_code: None,
                timed_out: false,
                output: format!("{err:#}"),
            }
        });
        let passed = result.passed();
        results.push(result);
        if !passed {
            break;
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn request(workdir: PathBuf) -> PostCheckRequest {
        PostCheckRequest {
            workdir,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    struct CountingRunner {
        fail_on: &'static str,
        seen: RefCell<Vec<String>>,
    }

    impl PostCheckRunner for CountingRunner {
        fn run(&self, command: &str, _request: &PostCheckRequest) -> Result<PostCheckResult> {
            self.seen.borrow_mut().push(command.to_string());
            Ok(PostCheckResult {
                command: command.to_string(),
                exit_code: Some(if command == self.fail_on { 1 } else { 0 }),
                timed_out: false,
                output: String::new(),
            })
        }
    }

    #[test]
    fn stops_after_first_failure() {
        let runner = CountingRunner {
            fail_on: "lint",
            seen: RefCell::new(Vec::new()),
        };
        let commands = vec!["build".to_string(), "lint".to_string(), "test".to_string()];
        let results = run_post_checks(&runner, &commands, &request(PathBuf::from(".")));
        assert_eq!(results.len(), 2);
        assert!(!results[1].passed());
        assert_eq!(runner.seen.borrow().as_slice(), ["build", "lint"]);
    }

    #[cfg(unix)]
    #[test]
    fn shell_checks_run_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker"), "x").expect("write");
        let req = request(temp.path().to_path_buf());

        let ok = ShellPostChecks.run("test -f marker && echo found", &req).expect("run");
        assert!(ok.passed());
        assert_eq!(ok.output, "found");

        let failed = ShellPostChecks.run("echo nope >&2; exit 4", &req).expect("run");
        assert_eq!(failed.exit_code, Some(4));
        assert_eq!(failed.output, "nope");
    }

    #[cfg(unix)]
    #[test]
    fn slow_check_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = PostCheckRequest {
            timeout: Duration::from_millis(200),
            ..request(temp.path().to_path_buf())
        };
        let result = ShellPostChecks.run("exec sleep 5", &req).expect("run");
        assert!(result.timed_out);
        assert!(!result.passed());
    }
}
