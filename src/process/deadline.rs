//! Run an external command under a hard wall-clock deadline.
//!
//! The child gets its own process group. If the deadline passes or shutdown
//! is triggered, the whole group is killed, so helpers the child forked do
//! not outlive the call.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::group::{self, GroupSignal};
use crate::error::DeadlineError;
use crate::shutdown::Shutdown;

/// Maximum captured output per stream.
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How long to wait for pipes to close after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Program, arguments and working directory of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Build from an argv-style list. `None` if the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Build a std command in its own process group.
    pub(crate) fn to_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        group::isolate(&mut cmd);
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    Expired,
    Cancelled,
}

/// Run `spec`, feeding `stdin` if given, and wait at most `timeout`.
///
/// A missing executable is reported as [`DeadlineError::NotFound`] so callers
/// can treat it as a configuration problem rather than a transient failure.
pub async fn run_with_deadline(
    spec: &CommandSpec,
    stdin: Option<&str>,
    timeout: Duration,
    shutdown: &Shutdown,
) -> Result<ProcessOutput, DeadlineError> {
    // Spawning into a missing directory also fails with ENOENT, which would
    // otherwise read as a missing executable.
    if let Some(dir) = &spec.cwd {
        if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(DeadlineError::MissingWorkdir {
                program: spec.program.clone(),
                dir: dir.clone(),
            });
        }
    }

    let started = Instant::now();
    let mut command = tokio::process::Command::from(spec.to_std());
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DeadlineError::NotFound {
                program: spec.program.clone(),
            }
        } else {
            DeadlineError::Spawn {
                program: spec.program.clone(),
                source: e,
            }
        }
    })?;
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, "Spawned child process");

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_string();
        tokio::spawn(async move {
            // A child that exits without reading closes the pipe; that is fine.
            let _ = pipe.write_all(input.as_bytes()).await;
            let _ = pipe.shutdown().await;
        });
    }
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let ending = tokio::select! {
        status = child.wait() => Ending::Exited(status),
        _ = tokio::time::sleep(timeout) => Ending::Expired,
        _ = shutdown.wait() => Ending::Cancelled,
    };

    let cancelled = matches!(ending, Ending::Cancelled);
    let status = match ending {
        Ending::Exited(status) => Some(status?),
        Ending::Expired | Ending::Cancelled => {
            if let Some(pid) = pid {
                if let Err(e) = group::signal_group(pid, GroupSignal::Kill) {
                    warn!(pid, error = %e, "Failed to kill process group");
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;
    let elapsed = started.elapsed();

    match (status, cancelled) {
        (Some(status), _) => Ok(ProcessOutput {
            code: status.code(),
            stdout,
            stderr,
            elapsed,
        }),
        (None, true) => Err(DeadlineError::Cancelled {
            program: spec.program.clone(),
        }),
        (None, false) => {
            warn!(program = %spec.program, ?timeout, "Process timed out, killed its process group");
            Err(DeadlineError::TimedOut {
                program: spec.program.clone(),
                timeout,
                stdout,
                stderr,
            })
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Wait briefly for a reader. A grandchild that escaped the group can hold
/// the pipe open forever, so give up after the grace period.
async fn collect(mut task: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => truncate_output(&String::from_utf8_lossy(&bytes)),
        _ => {
            task.abort();
            String::new()
        }
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
pub fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Shorten text for log lines and audit records.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_command() {
        let out = run_with_deadline(&sh("echo hello"), None, Duration::from_secs(5), &Shutdown::new())
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_is_delivered() {
        let out = run_with_deadline(
            &CommandSpec::new("cat"),
            Some("instruction text"),
            Duration::from_secs(5),
            &Shutdown::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "instruction text");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let out = run_with_deadline(&sh("echo oops >&2; exit 3"), None, Duration::from_secs(5), &Shutdown::new())
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let err = run_with_deadline(&sh("sleep 10"), None, Duration::from_millis(100), &Shutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeadlineError::TimedOut { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_whole_tree() {
        // The backgrounded sleep inherits stdout; if it survived, draining
        // the pipe would hang until the grace period.
        let started = Instant::now();
        let err = run_with_deadline(
            &sh("sleep 30 & sleep 30"),
            None,
            Duration::from_millis(300),
            &Shutdown::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeadlineError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let err = run_with_deadline(&sh("echo started; sleep 10"), None, Duration::from_millis(300), &Shutdown::new())
            .await
            .unwrap_err();
        match err {
            DeadlineError::TimedOut { stdout, .. } => assert_eq!(stdout.trim(), "started"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_cancels_run() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });
        let err = run_with_deadline(&sh("sleep 10"), None, Duration::from_secs(30), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, DeadlineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let spec = CommandSpec::new("inbox-pilot-no-such-binary-7f3a");
        let err = run_with_deadline(&spec, None, Duration::from_secs(1), &Shutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeadlineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_workdir_is_not_a_missing_binary() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::new("sh").arg("-c").arg("true").current_dir(dir.path().join("gone"));
        let err = run_with_deadline(&spec, None, Duration::from_secs(1), &Shutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeadlineError::MissingWorkdir { .. }), "got {err:?}");
    }

    #[test]
    fn from_argv_splits_program() {
        let argv: Vec<String> = vec!["claude".into(), "-p".into()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args, vec!["-p"]);
        assert_eq!(spec.to_string(), "claude -p");
        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[test]
    fn test_truncate_output_short() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn test_truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated 1000 bytes]"));
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "héllo";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }

    #[test]
    fn truncate_for_log_adds_ellipsis() {
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        assert_eq!(truncate_for_log("abc", 3), "abc");
    }
}
