//! External command execution.

use crate::errors::ActionError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status reported when the program could not be found, as a shell does.
pub const EXIT_NOT_FOUND: i32 = 127;

/// A command line to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Bytes written to standard input.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets standard input.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Returns true if `args` starts with `prefix`.
    #[must_use]
    pub fn has_args_prefix(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
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

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub status: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output with `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// The output for a program that is not installed.
    #[must_use]
    pub fn not_found(program: &str) -> Self {
        Self::failed(EXIT_NOT_FOUND, format!("{program}: command not found"))
    }

    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Converts a non-zero exit into [`ActionError::CommandFailed`].
    pub fn into_result(self, spec: &CommandSpec) -> Result<String, ActionError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(ActionError::command_failed(spec.to_string(), self.status, self.stderr))
        }
    }
}

/// Runs external commands.
///
/// `Err` is reserved for failures to run the command at all; a command that
/// ran and exited non-zero is an `Ok` output with that status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion and captures its output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ActionError>;
}

/// Runs `spec` and fails unless it exits with status 0.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<String, ActionError> {
    runner.run(spec).await?.into_result(spec)
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ActionError> {
        debug!(command = %spec, "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(program = %spec.program, "Program not found");
                return Ok(CommandOutput::not_found(&spec.program));
            }
            Err(e) => return Err(ActionError::Io(e)),
        };

        if let (Some(input), Some(mut pipe)) = (&spec.stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %spec, status = ?result.status, "Command finished");
        Ok(result)
    }
}
