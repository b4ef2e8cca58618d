//! Shell process management for the `sh.run` action.
//!
//! Commands run under the platform shell with a hard deadline and a
//! cooperative cancellation check. A killed process never leaks partial
//! output to the caller when the run was cancelled.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use turnwire_core::CancelToken;
use wait_timeout::ChildExt;

/// How long each wait slice lasts while polling a running child. Short
/// enough that cancellation lands quickly, long enough to avoid spinning.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Captured result of one shell invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunOutput {
    /// Exit code when the process terminated normally.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// True when the deadline elapsed and the process was killed.
    pub timed_out: bool,
    /// True when the run was cancelled; stdout/stderr are empty in that case.
    pub cancelled: bool,
}

/// Abstraction over spawning shell commands so the executor can be tested
/// without touching real processes.
pub trait ShellRunner: Send + Sync {
    /// Runs `command` and captures up to `max_capture` bytes per stream.
    fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
        max_capture: usize,
    ) -> Result<ShellRunOutput>;
}

/// Runs commands under the platform shell.
#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
        max_capture: usize,
    ) -> Result<ShellRunOutput> {
        let mut child = spawn_shell(command, cwd)?;
        // The pipes must be drained while the child runs or a chatty
        // process fills the OS pipe buffer and blocks mid-write, which
        // the wait loop would misread as a hang. One extra byte is kept
        // so a caller capping at the same limit still sees the cut.
        let cap = max_capture.saturating_add(1);
        let stdout_reader = spawn_drain(child.stdout.take(), cap);
        let stderr_reader = spawn_drain(child.stderr.take(), cap);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = child.wait_timeout(WAIT_SLICE)? {
                let (stdout, stderr) = collect(stdout_reader, stderr_reader);
                return Ok(ShellRunOutput {
                    status: status.code(),
                    stdout,
                    stderr,
                    timed_out: false,
                    cancelled: false,
                });
            }
            if cancel.is_cancelled() {
                child.kill()?;
                child.wait()?;
                // Readers are left to finish on pipe EOF; their output
                // is discarded for a cancelled run.
                return Ok(ShellRunOutput {
                    status: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                    cancelled: true,
                });
            }
            if Instant::now() >= deadline {
                child.kill()?;
                let status = child.wait()?;
                let (stdout, stderr) = collect(stdout_reader, stderr_reader);
                return Ok(ShellRunOutput {
                    status: status.code(),
                    stdout,
                    stderr,
                    timed_out: true,
                    cancelled: false,
                });
            }
        }
    }
}

fn spawn_drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    cap: usize,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut captured = Vec::new();
        let Some(mut reader) = pipe else {
            return captured;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = cap.saturating_sub(captured.len());
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        captured
    })
}

fn collect(
    stdout: thread::JoinHandle<Vec<u8>>,
    stderr: thread::JoinHandle<Vec<u8>>,
) -> (String, String) {
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

fn spawn_shell(command: &str, cwd: &Path) -> Result<Child> {
    let mut last_error = None;
    for (program, args) in shell_candidates() {
        let mut invocation = Command::new(program);
        invocation
            .args(args)
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match invocation.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => last_error = Some(err),
        }
    }
    match last_error {
        Some(err) => Err(err.into()),
        None => Err(anyhow!("no shell available on this platform")),
    }
}

#[cfg(unix)]
fn shell_candidates() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![("sh", vec!["-lc"]), ("bash", vec!["-lc"])]
}

#[cfg(windows)]
fn shell_candidates() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        ("cmd", vec!["/C"]),
        ("powershell", vec!["-NoProfile", "-Command"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_in_temp(
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ShellRunOutput> {
        let dir = tempfile::tempdir().expect("tempdir");
        PlatformShellRunner.run(command, dir.path(), timeout, cancel, 1 << 20)
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_in_temp("echo hello", Duration::from_secs(10), &CancelToken::new())
            .expect("command runs");
        assert_eq!(output.status, Some(0));
        assert!(output.stdout.contains("hello"));
        assert!(!output.timed_out);
        assert!(!output.cancelled);
    }

    #[test]
    fn reports_nonzero_exit_codes() {
        let output = run_in_temp("exit 3", Duration::from_secs(10), &CancelToken::new())
            .expect("command runs");
        assert_eq!(output.status, Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn output_larger_than_the_pipe_buffer_completes_promptly() {
        let started = Instant::now();
        let output = run_in_temp(
            "yes | head -c 200000",
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .expect("command runs");
        assert_eq!(output.status, Some(0));
        assert!(!output.timed_out);
        assert_eq!(output.stdout.len(), 200_000);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn capture_stops_at_the_requested_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = PlatformShellRunner
            .run(
                "yes | head -c 100000",
                dir.path(),
                Duration::from_secs(5),
                &CancelToken::new(),
                1024,
            )
            .expect("command runs");
        assert_eq!(output.status, Some(0));
        assert!(!output.timed_out);
        // One byte past the budget is kept so callers can see the cut.
        assert_eq!(output.stdout.len(), 1025);
    }

    #[cfg(unix)]
    #[test]
    fn kills_process_on_timeout() {
        let started = Instant::now();
        let output = run_in_temp("sleep 30", Duration::from_millis(300), &CancelToken::new())
            .expect("command runs");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_process_and_discards_output() {
        let cancel = CancelToken::new();
        let handle = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                cancel.cancel();
            })
        };
        let started = Instant::now();
        let output = run_in_temp("echo early; sleep 30", Duration::from_secs(60), &cancel)
            .expect("command runs");
        handle.join().expect("cancel thread");
        assert!(output.cancelled);
        assert!(output.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
