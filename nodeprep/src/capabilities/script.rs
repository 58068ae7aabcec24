//! Remote installer scripts.

use super::command::{run_checked, CommandRunner, CommandSpec};
use super::fetch::Fetcher;
use crate::errors::ActionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use tracing::info;

/// An installer script and how to invoke it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSource {
    /// Where to download the script from.
    pub url: String,
    /// Arguments passed to the script.
    pub args: Vec<String>,
    /// Environment passed to the script.
    pub env: BTreeMap<String, String>,
}

impl ScriptSource {
    /// Creates a source with no arguments or environment.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ScriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Downloads `script` to a temporary file and runs it with `sh`.
pub async fn run_script(
    fetcher: &dyn Fetcher,
    runner: &dyn CommandRunner,
    script: &ScriptSource,
) -> Result<(), ActionError> {
    let body = fetcher.fetch(&script.url).await?;
    if body.is_empty() {
        return Err(ActionError::download(&script.url, "empty response"));
    }

    let mut file = tempfile::Builder::new()
        .prefix("nodeprep-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(&body)?;
    file.flush()?;

    info!(source = %script, "Running installer script");
    let mut spec = CommandSpec::new("sh")
        .arg(file.path().to_string_lossy())
        .args(script.args.iter().cloned());
    spec.env.extend(script.env.clone());

    run_checked(runner, &spec).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::command::{CommandOutput, MockCommandRunner};
    use crate::capabilities::fetch::MockFetcher;

    #[test]
    fn test_script_display() {
        let script = ScriptSource::new("https://get.docker.com").with_arg("--mirror").with_arg("Aliyun");
        assert_eq!(script.to_string(), "https://get.docker.com --mirror Aliyun");
    }

    #[tokio::test]
    async fn test_run_script_passes_args_and_env() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url| url.ends_with("get.k3s.io"))
            .returning(|_| Ok(b"#!/bin/sh\nexit 0\n".to_vec()));

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == "sh"
                    && spec.args.len() == 2
                    && spec.args[1] == "server"
                    && spec.env.get("INSTALL_K3S_EXEC").map(String::as_str) == Some("--docker")
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));

        let script = ScriptSource::new("https://get.k3s.io")
            .with_arg("server")
            .with_env("INSTALL_K3S_EXEC", "--docker");
        run_script(&fetcher, &runner, &script).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_script_download_failure_skips_execution() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|url| Err(ActionError::download(url.to_string(), "connection refused")));
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let err = run_script(&fetcher, &runner, &ScriptSource::new("https://get.k3s.io"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Download { .. }));
    }
}
