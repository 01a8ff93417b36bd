//! Helpers for running child processes with timeouts and bounded output.
//!
//! On Unix every child leads its own process group and is killed as a group,
//! so tools it spawned die with it and stop holding our pipes open. Pipe
//! readers are joined against a deadline; a reader that never finishes is
//! detached and its output dropped.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Lines buffered between the stdout reader thread and the consumer.
const LINE_QUEUE: usize = 256;

/// How long pipe readers get to drain once the process group is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Streaming only: no stdout line arrived within the stall window.
    pub stalled: bool,
    /// Streaming only: the line callback asked to stop the process.
    pub aborted: Option<String>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exited zero and was not stopped by us.
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.stalled && self.aborted.is_none()
    }
}

/// What a streaming consumer wants after seeing a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineControl {
    Continue,
    /// Kill the process and record the reason.
    Abort(String),
}

type Captured = (Vec<u8>, usize);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and both pipes are drained on helper threads while the child runs.
/// `output_limit_bytes` bounds the amount of stdout/stderr kept in memory (bytes beyond
/// it are discarded while still draining the pipe). The timeout covers the whole call:
/// descendants that keep the pipes open past it are killed with the group.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let deadline = Instant::now() + timeout;
    let (mut child, stdin_handle) = spawn_piped(cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_and_wait(&mut child)?
        }
    };

    // The child is gone; anything still holding the pipes is a descendant.
    let readers_done = stdout_handle.is_finished() && stderr_handle.is_finished();
    if !readers_done && !wait_all_finished(&[&stdout_handle, &stderr_handle], deadline) {
        warn!("descendants kept output pipes open, killing process group");
        timed_out = true;
        kill_group(&child);
    }
    let grace = Instant::now() + READER_GRACE;
    let (stdout, stdout_truncated) = join_by(stdout_handle, grace, "stdout")?;
    let (stderr, stderr_truncated) = join_by(stderr_handle, grace, "stderr")?;
    finish_stdin(stdin_handle);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        stalled: false,
        aborted: None,
    })
}

/// Run a command and hand each stdout line to `on_line` as it arrives.
///
/// A reader thread pushes lines into a bounded channel; this thread waits on it with
/// `stall` as the receive timeout. No line within `stall` kills the process group
/// (`stalled`), as does passing the overall `timeout` (`timed_out`) or `on_line`
/// returning [`LineControl::Abort`]. Stdout is still collected up to `output_limit_bytes`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), stall_secs = stall.as_secs(), output_limit_bytes))]
pub fn run_command_streaming<F>(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    stall: Duration,
    output_limit_bytes: usize,
    mut on_line: F,
) -> Result<CommandOutput>
where
    F: FnMut(&str) -> LineControl,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let (mut child, stdin_handle) = spawn_piped(cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(LINE_QUEUE);
    let stdout_handle = thread::spawn(move || -> Result<Captured> {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).context("read line")?;
            if n == 0 || tx.send(line).is_err() {
                return Ok((Vec::new(), 0));
            }
        }
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut collected = Vec::new();
    let mut stdout_truncated = 0usize;
    let mut timed_out = false;
    let mut stalled = false;
    let mut aborted = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        let wait = stall.min(deadline - now);
        match rx.recv_timeout(wait) {
            Ok(line) => {
                let remaining = output_limit_bytes.saturating_sub(collected.len());
                let keep = line.len().min(remaining);
                collected.extend_from_slice(&line[..keep]);
                stdout_truncated += line.len() - keep;

                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                if let LineControl::Abort(reason) = on_line(text) {
                    warn!(%reason, "stream consumer aborted command");
                    aborted = Some(reason);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    timed_out = true;
                } else {
                    stalled = true;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(rx);

    let status = if timed_out || stalled || aborted.is_some() {
        if timed_out {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
        } else if stalled {
            warn!(stall_secs = stall.as_secs(), "command stalled, killing process group");
        }
        kill_and_wait(&mut child)?
    } else {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(remaining).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out after closing stdout, killing process group"
                );
                timed_out = true;
                kill_and_wait(&mut child)?
            }
        }
    };

    if !stderr_handle.is_finished() && !wait_all_finished(&[&stderr_handle], deadline) {
        warn!("descendants kept stderr open, killing process group");
        timed_out = true;
        kill_group(&child);
    }
    let grace = Instant::now() + READER_GRACE;
    join_by(stdout_handle, grace, "stdout")?;
    let (stderr, stderr_truncated) = join_by(stderr_handle, grace, "stderr")?;
    finish_stdin(stdin_handle);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(
        exit_code = ?status.code(),
        timed_out,
        stalled,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "streaming command finished"
    );
    Ok(CommandOutput {
        status,
        stdout: collected,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        stalled,
        aborted,
    })
}

/// Spawn with piped output in a fresh process group; stdin is written by a helper thread.
fn spawn_piped(
    mut cmd: Command,
    stdin: Option<&[u8]>,
) -> Result<(Child, Option<JoinHandle<()>>)> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let writer = match stdin {
        Some(input) => {
            let pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(pipe, &input)))
        }
        None => None,
    };
    Ok((child, writer))
}

fn write_stdin(mut pipe: ChildStdin, input: &[u8]) {
    match pipe.write_all(input) {
        Ok(()) => {}
        // The child exited or closed stdin without reading everything.
        Err(err) if err.kind() == ErrorKind::BrokenPipe => debug!("stdin closed early"),
        Err(err) => warn!(%err, "write stdin"),
    }
}

/// A writer still blocked after the child is gone is detached.
fn finish_stdin(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!("stdin writer still blocked, detaching");
        }
    }
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    kill_child(child);
    child.wait().context("wait command after kill")
}

/// SIGKILL the child's process group. Best effort: the group may already be empty.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let signalled = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match signalled {
            Ok(status) if status.success() => debug!(pgid = child.id(), "process group killed"),
            Ok(status) => debug!(pgid = child.id(), %status, "process group already gone"),
            Err(err) => warn!(%err, "could not signal process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(%err, "kill child");
    }
}

/// Poll until every handle has finished or `deadline` passes.
fn wait_all_finished<T>(handles: &[&JoinHandle<T>], deadline: Instant) -> bool {
    loop {
        if handles.iter().all(|handle| handle.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Join a pipe reader, giving up at `deadline`; an abandoned reader yields no output.
fn join_by(
    handle: JoinHandle<Result<Captured>>,
    deadline: Instant,
    pipe: &str,
) -> Result<Captured> {
    if !wait_all_finished(&[&handle], deadline) {
        warn!(pipe, "output reader did not finish, detaching");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result.with_context(|| format!("join {pipe}")),
        Err(_) => Err(anyhow!("{pipe} reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let out = run_command_with_timeout(
            sh("cat; echo done >&2"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "hello");
        assert_eq!(out.stderr_lossy().trim(), "done");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let out = run_command_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn timeout_kills_command() {
        let out = run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    /// Without `exec` the sleep is a grandchild that holds the pipes open.
    #[test]
    fn timeout_kills_grandchildren_too() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30; echo done"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(out.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[test]
    fn background_child_holding_pipes_is_bounded_by_timeout() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30 & echo early"),
            None,
            Duration::from_millis(500),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(out.status.success());
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    /// The child fills its stdout pipe before reading stdin; a blocking stdin
    /// write on the calling thread would never let the readers start.
    #[test]
    fn large_stdin_with_chatty_child_does_not_deadlock() {
        let input = vec![b'x'; 1024 * 1024];
        let out = run_command_with_timeout(
            sh("head -c 300000 /dev/zero; wc -c"),
            Some(&input),
            Duration::from_secs(20),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert!(out.success());
        assert!(out.stdout_truncated > 0);
    }

    #[test]
    fn streaming_delivers_lines_in_order() {
        let mut seen = Vec::new();
        let out = run_command_streaming(
            sh("echo one; echo two; echo three"),
            None,
            Duration::from_secs(10),
            Duration::from_secs(5),
            1024,
            |line| {
                seen.push(line.to_string());
                LineControl::Continue
            },
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[test]
    fn silent_stream_is_stalled() {
        let out = run_command_streaming(
            sh("echo start; exec sleep 5"),
            None,
            Duration::from_secs(30),
            Duration::from_millis(300),
            1024,
            |_| LineControl::Continue,
        )
        .expect("run");
        assert!(out.stalled);
        assert!(!out.timed_out);
        assert_eq!(out.stdout_lossy(), "start\n");
    }

    #[test]
    fn stalled_stream_kills_grandchildren_too() {
        let started = Instant::now();
        let out = run_command_streaming(
            sh("echo start; sleep 30; echo late"),
            None,
            Duration::from_secs(60),
            Duration::from_millis(300),
            1024,
            |_| LineControl::Continue,
        )
        .expect("run");
        assert!(out.stalled);
        assert_eq!(out.stdout_lossy(), "start\n");
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[test]
    fn consumer_abort_kills_command() {
        let out = run_command_streaming(
            sh("echo bad; exec sleep 5"),
            None,
            Duration::from_secs(30),
            Duration::from_secs(10),
            1024,
            |line| {
                if line == "bad" {
                    LineControl::Abort("saw bad".to_string())
                } else {
                    LineControl::Continue
                }
            },
        )
        .expect("run");
        assert_eq!(out.aborted.as_deref(), Some("saw bad"));
        assert!(!out.success());
    }
}
