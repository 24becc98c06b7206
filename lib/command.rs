//! Execution of the external list and transform commands.
//!
//! The caches only see the [`CommandRunner`] capability. [`ShellRunner`] is the production
//! implementation; tests substitute scripted runners.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};

/// Maximum number of stderr bytes retained on a failed command for diagnostics.
const MAX_STDERR_BYTES: usize = 4096;

/// A single environment binding passed to a command, e.g. `INPUT=<filename>`.
pub type Binding = (String, OsString);

/// Captured output of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Everything the command wrote to standard output.
    pub stdout: Bytes,
}

/// Why a command did not produce usable output.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be started or waited on.
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command ran but exited unsuccessfully.
    #[error("command exited with {}: {stderr}", display_code(.code))]
    Exit {
        /// Exit code, or `None` if the command was killed by a signal.
        code: Option<i32>,
        /// Captured standard error, truncated.
        stderr: String,
    },

    /// The command did not finish within the configured bound.
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    /// The task driving the command panicked or was aborted.
    #[error("command task failed: {0}")]
    Aborted(String),
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_owned(), |c| format!("status {c}"))
}

impl CommandError {
    /// The exit code of the failed command, if it exited on its own.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => *code,
            Self::Spawn(_) | Self::TimedOut(_) | Self::Aborted(_) => None,
        }
    }
}

/// Capability to run a shell command with environment bindings.
///
/// Non-zero exit and I/O failures are reported as [`CommandError`]; implementations never panic
/// on command failure.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `command`, exporting each binding into its environment, and capture its stdout.
    fn run(
        &self,
        command: &str,
        bindings: &[Binding],
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

/// Runs commands through `<shell> -c <command>` using `tokio::process`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: OsString,
    timeout: Option<Duration>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: OsString::from("sh"),
            timeout: None,
        }
    }
}

impl ShellRunner {
    /// Create a runner using `shell` as the interpreter.
    #[must_use]
    pub fn new(shell: impl AsRef<OsStr>) -> Self {
        Self {
            shell: shell.as_ref().to_os_string(),
            timeout: None,
        }
    }

    /// Bound every command by `timeout`. The child is killed once the bound elapses.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_unbounded(
        &self,
        command: &str,
        bindings: &[Binding],
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in bindings {
            cmd.env(key, value);
        }

        let output = cmd.spawn()?.wait_with_output().await?;
        if output.status.success() {
            return Ok(CommandOutput {
                stdout: Bytes::from(output.stdout),
            });
        }

        let stderr_len = output.stderr.len().min(MAX_STDERR_BYTES);
        Err(CommandError::Exit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr[..stderr_len])
                .trim_end()
                .to_owned(),
        })
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(name = "ShellRunner::run", skip(self, bindings))]
    async fn run(
        &self,
        command: &str,
        bindings: &[Binding],
    ) -> Result<CommandOutput, CommandError> {
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_unbounded(command, bindings))
                .await
                .unwrap_or(Err(CommandError::TimedOut(limit))),
            None => self.run_unbounded(command, bindings).await,
        };
        match &result {
            Ok(out) => debug!(bytes = out.stdout.len(), "command succeeded"),
            Err(e) => debug!(error = %e, "command failed"),
        }
        result
    }
}
