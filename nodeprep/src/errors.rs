//! Error types for the nodeprep orchestrator.
//!
//! Three layers: [`NodeprepError`] at the crate boundary,
//! [`PipelineValidationError`] for pipelines rejected at build time, and
//! [`ActionError`] for a probe, action or capability call that failed while
//! the pipeline was running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for nodeprep operations.
#[derive(Debug, Error)]
pub enum NodeprepError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for NodeprepError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure of a single action, probe or capability call.
#[derive(Debug, Error)]
pub enum ActionError {
    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed (exit {}): {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// The exit code, if the process exited normally.
        code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// A file or process I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Downloading a script, key or manifest failed.
    #[error("download of {url} failed: {reason}")]
    Download {
        /// The URL being fetched.
        url: String,
        /// The reason for failure.
        reason: String,
    },

    /// A precondition for the action does not hold.
    #[error("{0}")]
    Precondition(String),

    /// Polling exhausted its schedule without the condition holding.
    #[error("condition not met after {checks} checks")]
    TimedOut {
        /// The number of checks performed.
        checks: usize,
    },

    /// Output of an external tool could not be understood.
    #[error("unexpected output from {tool}: {reason}")]
    Parse {
        /// The tool whose output was parsed.
        tool: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl ActionError {
    /// Creates a command failure error.
    #[must_use]
    pub fn command_failed(
        command: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            code,
            stderr: stderr.into().trim().to_string(),
        }
    }

    /// Creates a download failure error.
    #[must_use]
    pub fn download(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse failure error.
    #[must_use]
    pub fn parse(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-MISSING-DEP").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}
