//! External command execution.
//!
//! Mount helpers (`mount`, `umount`, the FUSE provider binary) are driven as
//! child processes.  Their failures are only reported as text on stderr, so
//! [`ExecOutput`] keeps both streams around for the caller to inspect.
//!
//! Every execution is tagged with a process-wide `exec_id` so the "running"
//! and "exited" log lines of one command can be paired up.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

static EXEC_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_exec_id() -> u64 {
    EXEC_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; `None` when the child was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// A successful run with empty output.
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Default::default()
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// `true` when the child exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed; what `umount` & co. print on failure.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(self.stdout.trim());
        if !out.is_empty() && !self.stderr.trim().is_empty() {
            out.push('\n');
        }
        out.push_str(self.stderr.trim());
        out
    }

    /// Short description of the exit status, for error messages.
    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_owned(),
        }
    }
}

/// Runs external programs to completion.
///
/// The production implementation is [`SystemExecutor`]; tests substitute a
/// recording fake.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` with `args` and wait for it to exit.
    ///
    /// `Err` means the process could not be started at all; a non-zero exit
    /// is reported through [`ExecOutput::code`].
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<ExecOutput>;
}

/// Spawns real child processes via [`tokio::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<ExecOutput> {
        let exec_id = next_exec_id();
        info!(exec_id, program, ?args, "running command");

        let output = match tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!(exec_id, program, error = %e, "process failed to start");
                return Err(e);
            }
        };

        let result = ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success() {
            debug!(exec_id, program, "process exited successfully");
        } else {
            warn!(
                exec_id,
                program,
                status = %result.status_text(),
                output = %result.combined(),
                "process exited with failure",
            );
        }
        Ok(result)
    }
}
