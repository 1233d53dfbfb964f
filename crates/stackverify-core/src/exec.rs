//! External process execution.
//!
//! Every external invocation (provisioning, live-state queries, git) goes
//! through [`CommandRunner`] so tests can substitute a scripted runner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ExecError;

/// A fully described process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run (looked up on `PATH`).
    pub program: String,

    /// Arguments, passed verbatim.
    pub args: Vec<String>,

    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Hard wall-clock limit; no limit when `None`.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the process exited successfully.
    pub success: bool,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            success: true,
            ..Self::default()
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            success: false,
            ..Self::default()
        }
    }

    /// Whether this process passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Stderr if present, otherwise stdout; used for error messages.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs external processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. A non-zero exit is a successful `Ok` with
    /// `success == false`; only spawn/wait/timeout problems are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        if spec.program.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let start = Instant::now();
        let rendered = spec.to_string();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        tracing::debug!(command = %rendered, "spawning");
        let child = command.spawn().map_err(|source| ExecError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let waited = match spec.timeout {
            Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecError::TimedOut {
                    command: rendered.clone(),
                    timeout_secs: limit.as_secs(),
                })?,
            _ => child.wait_with_output().await,
        };
        let output = waited.map_err(|source| ExecError::Wait {
            command: rendered.clone(),
            source,
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_passed() {
        assert!(CommandOutput::ok("hello").passed());
        assert!(!CommandOutput::failed(1, "error").passed());
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let mut out = CommandOutput::failed(1, "  boom \n");
        out.stdout = "ignored".to_string();
        assert_eq!(out.diagnostic(), "boom");
        assert_eq!(CommandOutput::failed(2, "").diagnostic(), "");
    }

    #[test]
    fn test_spec_renders_as_command_line() {
        let spec = CommandSpec::new("gcloud")
            .args(["projects", "describe", "p-1"])
            .arg("--format")
            .arg("json");
        assert_eq!(spec.to_string(), "gcloud projects describe p-1 --format json");
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let spec = CommandSpec::new("echo").arg("hello");
        let result = TokioCommandRunner.run(&spec).await.expect("execute failed");
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let spec = CommandSpec::new("false");
        let result = TokioCommandRunner.run(&spec).await.expect("execute failed");
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_empty_program_rejected() {
        let err = TokioCommandRunner
            .run(&CommandSpec::default())
            .await
            .expect_err("empty program must fail");
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(50)));
        let err = TokioCommandRunner.run(&spec).await.expect_err("must time out");
        assert!(matches!(err, ExecError::TimedOut { .. }));
    }
}
