//! Spawning child processes from an explicit argument vector.
//!
//! No shell is involved: the program and its arguments are handed to the OS
//! as-is. Stdin is always closed (several agent CLIs block forever on an open,
//! unfed stdin), stdout/stderr are drained concurrently and bounded, and the
//! timeout is enforced by killing the child's whole process group, so
//! grandchildren holding the output pipes die with it.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::error::BoundaryError;
use crate::core::truncate::truncation_marker;

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the program could not be found.
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

/// How long output readers may keep draining after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output, already bounded and decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Parameters for one child process.
#[derive(Debug, Clone)]
pub struct ProcessRequest<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run `argv` directly (no shell) with a timeout and bounded output capture.
///
/// Non-zero exits and timeouts are reported in the output, not as errors. A
/// missing program is reported as exit code 127.
#[instrument(skip_all, fields(program = request.argv.first().map(String::as_str), timeout_secs = request.timeout.as_secs()))]
pub fn run_process(request: &ProcessRequest<'_>) -> Result<ProcessOutput> {
    let (program, args) = request.argv.split_first().ok_or(BoundaryError::EmptyArgv)?;
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(request.cwd)
        .envs(request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(program = %program, "program not found");
            return Ok(ProcessOutput {
                exit_code: NOT_FOUND_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("command not found: {program}"),
                duration: start.elapsed(),
                timed_out: false,
            });
        }
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = request.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(request.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = timed_out.then(|| Instant::now() + DRAIN_GRACE);
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, drain_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        exit_code_of(status)
    };
    debug!(exit_code, timed_out, "command finished");
    Ok(ProcessOutput {
        exit_code,
        stdout: decode(&stdout, stdout_truncated),
        stderr: decode(&stderr, stderr_truncated),
        duration: start.elapsed(),
        timed_out,
    })
}

/// SIGKILL the child's process group; falls back to the child alone.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => {
            warn!(err = %e, "killpg failed, killing child only");
            child.kill().context("kill child")
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn decode(bytes: &[u8], truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&truncation_marker(truncated));
    }
    text
}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Join a reader thread. With a deadline, a reader still blocked on a pipe
/// held open by an escaped process is abandoned and reports nothing.
fn join_output(handle: ReaderHandle, deadline: Option<Instant>) -> Result<(Vec<u8>, usize)> {
    if let Some(deadline) = deadline {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("output pipe still open after kill, abandoning reader");
                return Ok((Vec::new(), 0));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Keep at most `limit` bytes, still draining the pipe so the child never blocks.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
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

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn run(parts: &[&str], timeout: Duration, limit: usize) -> ProcessOutput {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = argv(parts);
        let env = BTreeMap::new();
        run_process(&ProcessRequest {
            argv: &argv,
            cwd: temp.path(),
            env: &env,
            timeout,
            output_limit_bytes: limit,
        })
        .expect("run")
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let out = run(
            &["sh", "-c", "echo out; echo err >&2; exit 3"],
            Duration::from_secs(10),
            1024,
        );
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn stdin_is_closed() {
        // `cat` with an open stdin would block until the timeout.
        let out = run(&["cat"], Duration::from_secs(10), 1024);
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
    }

    #[test]
    fn arguments_are_not_shell_interpreted() {
        let out = run(&["echo", "$HOME", "`id`", "a;b"], Duration::from_secs(10), 1024);
        assert_eq!(out.stdout, "$HOME `id` a;b\n");
    }

    #[test]
    fn timeout_kills_child_and_reports_conventional_code() {
        let out = run(&["sleep", "5"], Duration::from_millis(200), 1024);
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.duration < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let out = run(
            &["sh", "-c", "sleep 6; echo done"],
            Duration::from_millis(300),
            1024,
        );
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!out.stdout.contains("done"));
        assert!(out.duration < Duration::from_secs(3), "took {:?}", out.duration);
    }

    #[test]
    fn output_is_bounded_with_marker() {
        let out = run(&["sh", "-c", "printf 0123456789"], Duration::from_secs(10), 4);
        assert_eq!(out.stdout, "0123\n[truncated 6 bytes]");
    }

    #[test]
    fn missing_program_is_exit_127() {
        let out = run(&["definitely-not-a-real-program-xyz"], Duration::from_secs(10), 1024);
        assert_eq!(out.exit_code, NOT_FOUND_EXIT_CODE);
        assert!(out.stderr.contains("command not found"));
    }

    #[test]
    fn env_is_passed_through() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = argv(&["sh", "-c", "printf %s \"$HARNESS_TEST_VAR\""]);
        let mut env = BTreeMap::new();
        env.insert("HARNESS_TEST_VAR".to_string(), "value".to_string());
        let out = run_process(&ProcessRequest {
            argv: &argv,
            cwd: temp.path(),
            env: &env,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1024,
        })
        .expect("run");
        assert_eq!(out.stdout, "value");
    }
}
