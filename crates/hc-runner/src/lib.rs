//! Invocation of the disk-image helper binary with safety controls.
//!
//! The capability prober needs to run the helper with self-description
//! arguments and capture its stdout. A misbehaving helper build must not be
//! able to hang the host manager or exhaust its memory, so every invocation
//! gets:
//!
//! - A per-invocation timeout with SIGTERM → SIGKILL escalation
//! - A cap on captured output size
//! - A scrubbed environment (`LC_ALL=C`) so listings are locale-stable
//! - Path validation to prevent shell-metacharacter injection
//!
//! A timed-out invocation is not an error at this layer: the captured output
//! is returned with `timed_out = true` and the caller decides what that
//! means (the prober treats it as a failed invocation).

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default timeout per invocation in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default maximum captured output size in bytes (1MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL in milliseconds.
const SIGTERM_GRACE_MS: u64 = 500;

/// Poll interval while waiting for the helper to exit.
const WAIT_POLL_MS: u64 = 10;

/// Errors that can occur when invoking the helper.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("helper not found: {0}")]
    NotFound(String),

    #[error("helper failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("invalid helper path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of one helper invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperOutput {
    /// Path of the binary that was executed.
    pub path: String,

    /// Arguments passed to it.
    pub args: Vec<String>,

    /// Standard output (may be truncated).
    pub stdout: Vec<u8>,

    /// Standard error (may be truncated).
    pub stderr: Vec<u8>,

    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,

    /// Whether either stream hit the output cap.
    pub truncated: bool,

    /// Whether the invocation hit the timeout and was killed.
    pub timed_out: bool,

    /// Wall-clock duration of the invocation.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl HelperOutput {
    /// Stdout as a string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Stderr as a string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Whether the helper exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Configuration for helper invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Timeout per invocation.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Maximum captured output size per stream in bytes.
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs the helper binary and captures its output.
#[derive(Debug)]
pub struct HelperRunner {
    config: RunnerConfig,
}

impl HelperRunner {
    /// Create a runner with the given configuration.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Create a runner with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RunnerConfig::default())
    }

    /// Run the binary at `path` with `args`, capturing stdout and stderr.
    ///
    /// Returns `HelperOutput` whenever the process actually ran, including
    /// non-zero exits and timeouts. Errors mean the process never executed.
    pub fn run(&self, path: &Path, args: &[&str]) -> Result<HelperOutput, RunnerError> {
        self.validate_path(path)?;

        let path_str = path.to_string_lossy().to_string();
        debug!(
            helper = %path_str,
            args = ?args,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "invoking helper"
        );

        let start = Instant::now();

        let mut child = match self.build_command(path, args).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(helper = %path_str, "helper not found");
                return Err(RunnerError::NotFound(path_str));
            }
            Err(e) => {
                error!(helper = %path_str, error = %e, "failed to spawn helper");
                return Err(RunnerError::SpawnFailed(e.to_string()));
            }
        };

        // Reader threads keep the pipes drained so the helper can never
        // block on a full pipe while we wait for it.
        let cap = self.config.max_output_bytes;
        let stdout_handle = child.stdout.take().map(|s| capture_stream(s, cap));
        let stderr_handle = child.stderr.take().map(|s| capture_stream(s, cap));

        let (exit_code, timed_out) = self.wait_with_timeout(&mut child)?;

        let (stdout, out_truncated) = join_capture(stdout_handle);
        let (stderr, err_truncated) = join_capture(stderr_handle);

        let duration = start.elapsed();
        let output = HelperOutput {
            path: path_str,
            args: args.iter().map(|s| s.to_string()).collect(),
            stdout,
            stderr,
            exit_code,
            truncated: out_truncated || err_truncated,
            timed_out,
            duration,
        };

        debug!(
            helper = %output.path,
            exit_code = ?output.exit_code,
            duration_ms = duration.as_millis() as u64,
            timed_out,
            "helper invocation complete"
        );

        Ok(output)
    }

    /// Reject paths that could be misinterpreted by downstream tooling and
    /// fail early on absolute paths that do not exist.
    fn validate_path(&self, path: &Path) -> Result<(), RunnerError> {
        let raw = path.to_string_lossy();

        if raw.contains(['|', '&', ';', '$', '`', '\n', '\r']) {
            return Err(RunnerError::InvalidPath(format!(
                "path contains shell metacharacters: {raw}"
            )));
        }

        if path.is_absolute() && !path.exists() {
            return Err(RunnerError::NotFound(raw.to_string()));
        }

        Ok(())
    }

    /// Build the command with a scrubbed environment.
    fn build_command(&self, path: &Path, args: &[&str]) -> Command {
        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        if let Ok(sys_path) = std::env::var("PATH") {
            command.env("PATH", sys_path);
        }
        // Pin the locale so listings parse the same everywhere.
        command.env("LC_ALL", "C");
        command.env("LANG", "C");

        command
    }

    /// Poll for exit until the deadline, then kill.
    fn wait_with_timeout(&self, child: &mut Child) -> Result<(Option<i32>, bool), RunnerError> {
        let deadline = Instant::now() + self.config.timeout;

        loop {
            match child.try_wait()? {
                Some(status) => return Ok((status.code(), false)),
                None => {
                    if Instant::now() >= deadline {
                        warn!("helper timed out, killing");
                        kill_with_grace(child);
                        let status = child.wait().ok();
                        return Ok((status.and_then(|s| s.code()), true));
                    }
                    thread::sleep(Duration::from_millis(WAIT_POLL_MS));
                }
            }
        }
    }
}

/// Capture a stream on a dedicated thread, up to `cap` bytes.
///
/// Reading continues past the cap (discarding data) so the child sees an
/// open, drained pipe until it exits.
fn capture_stream<R: Read + Send + 'static>(
    mut stream: R,
    cap: usize,
) -> thread::JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; 8192];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let space = cap.saturating_sub(buf.len());
                    let take = n.min(space);
                    buf.extend_from_slice(&chunk[..take]);
                    if n > take {
                        truncated = true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        (buf, truncated)
    })
}

/// Join a capture thread, tolerating a panicked reader.
fn join_capture(handle: Option<thread::JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    match handle {
        Some(h) => h.join().unwrap_or_else(|_| {
            error!("output capture thread panicked");
            (Vec::new(), true)
        }),
        None => (Vec::new(), false),
    }
}

/// Kill a process with SIGTERM, then SIGKILL after a grace period.
#[cfg(unix)]
fn kill_with_grace(child: &mut Child) {
    let pid = child.id() as i32;

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    trace!(pid, "sent SIGTERM");

    thread::sleep(Duration::from_millis(SIGTERM_GRACE_MS));

    match child.try_wait() {
        Ok(Some(_)) => {
            trace!(pid, "helper exited after SIGTERM");
        }
        Ok(None) => {
            warn!(pid, "helper did not exit after SIGTERM, sending SIGKILL");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        Err(e) => {
            error!(pid, error = %e, "failed to check helper status");
        }
    }
}

#[cfg(not(unix))]
fn kill_with_grace(child: &mut Child) {
    let _ = child.kill();
}

// Serde module for Duration as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
