//! Container runtime daemon.

use super::command::{run_checked, CommandRunner, CommandSpec};
use super::fetch::Fetcher;
use super::script::{run_script, ScriptSource};
use crate::errors::ActionError;
use crate::persist::{self, KeyPath};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What the running daemon reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeInfo {
    /// Daemon version.
    #[serde(rename = "ServerVersion", default)]
    pub server_version: String,
    /// Runtime used when a container does not name one.
    #[serde(rename = "DefaultRuntime", default)]
    pub default_runtime: Option<String>,
    /// Registered OCI runtimes by name.
    #[serde(rename = "Runtimes", default)]
    pub runtimes: BTreeMap<String, Value>,
}

impl RuntimeInfo {
    /// Returns true if a runtime named `name` is registered.
    #[must_use]
    pub fn has_runtime(&self, name: &str) -> bool {
        self.runtimes.contains_key(name)
    }
}

/// The container runtime daemon.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns true if the runtime CLI is present.
    async fn is_installed(&self) -> Result<bool, ActionError>;

    /// Installs the runtime with a remote installer script.
    async fn install(&self, script: &ScriptSource) -> Result<(), ActionError>;

    /// Reads the daemon configuration document.
    async fn read_config(&self) -> Result<Value, ActionError>;

    /// Merges `settings` into the daemon configuration. Returns true if it changed.
    async fn write_config(&self, settings: &Value) -> Result<bool, ActionError>;

    /// Removes `keys` from the daemon configuration. Returns true if it changed.
    async fn remove_config(&self, keys: &[KeyPath]) -> Result<bool, ActionError>;

    /// Restarts the daemon so configuration changes take effect.
    async fn restart(&self) -> Result<(), ActionError>;

    /// Queries the running daemon.
    async fn runtime_info(&self) -> Result<RuntimeInfo, ActionError>;
}

/// [`ContainerRuntime`] for the Docker daemon under systemd.
#[derive(Clone)]
pub struct DockerDaemon {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
    config_path: PathBuf,
}

impl DockerDaemon {
    /// Creates a handle for the daemon configured at `config_path`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn Fetcher>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            fetcher,
            config_path: config_path.into(),
        }
    }
}

impl fmt::Debug for DockerDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerDaemon")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for DockerDaemon {
    async fn is_installed(&self) -> Result<bool, ActionError> {
        let output = self
            .runner
            .run(&CommandSpec::new("docker").arg("--version"))
            .await?;
        Ok(output.success())
    }

    async fn install(&self, script: &ScriptSource) -> Result<(), ActionError> {
        run_script(self.fetcher.as_ref(), self.runner.as_ref(), script).await
    }

    async fn read_config(&self) -> Result<Value, ActionError> {
        Ok(persist::read_json(&self.config_path)?)
    }

    async fn write_config(&self, settings: &Value) -> Result<bool, ActionError> {
        let changed = persist::merge_json_file(&self.config_path, settings)?;
        if changed {
            info!(path = %self.config_path.display(), "Updated daemon configuration");
        }
        Ok(changed)
    }

    async fn remove_config(&self, keys: &[KeyPath]) -> Result<bool, ActionError> {
        Ok(persist::remove_json_keys(&self.config_path, keys)?)
    }

    async fn restart(&self) -> Result<(), ActionError> {
        info!("Restarting docker");
        let spec = CommandSpec::new("systemctl").args(["restart", "docker"]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, ActionError> {
        let spec = CommandSpec::new("docker").args(["info", "--format", "{{json .}}"]);
        let stdout = run_checked(self.runner.as_ref(), &spec).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| ActionError::parse("docker info", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::command::{CommandOutput, MockCommandRunner};
    use crate::capabilities::fetch::MockFetcher;
    use crate::persist::key_path;
    use serde_json::json;

    fn daemon(runner: MockCommandRunner, path: PathBuf) -> DockerDaemon {
        DockerDaemon::new(Arc::new(runner), Arc::new(MockFetcher::new()), path)
    }

    #[tokio::test]
    async fn test_runtime_info_parses_runtimes() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput::ok(
                r#"{"ServerVersion":"24.0.7","DefaultRuntime":"nvidia","Runtimes":{"nvidia":{"path":"nvidia-container-runtime"},"runc":{"path":"runc"}}}"#,
            ))
        });

        let info = daemon(runner, PathBuf::from("/nonexistent")).runtime_info().await.unwrap();
        assert_eq!(info.server_version, "24.0.7");
        assert_eq!(info.default_runtime.as_deref(), Some("nvidia"));
        assert!(info.has_runtime("nvidia"));
        assert!(!info.has_runtime("kata"));
    }

    #[tokio::test]
    async fn test_runtime_info_rejects_garbage() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::ok("Cannot connect to the Docker daemon")));

        let err = daemon(runner, PathBuf::from("/nonexistent")).runtime_info().await.unwrap_err();
        assert!(matches!(err, ActionError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_write_and_remove_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker/daemon.json");
        let docker = daemon(MockCommandRunner::new(), path.clone());

        let settings = json!({"default-runtime": "nvidia", "runtimes": {"nvidia": {"path": "nvidia-container-runtime"}}});
        assert!(docker.write_config(&settings).await.unwrap());
        assert!(!docker.write_config(&settings).await.unwrap());
        assert!(persist::json_contains(&docker.read_config().await.unwrap(), &settings));

        let keys = vec![key_path(&["default-runtime"]), key_path(&["runtimes", "nvidia"])];
        assert!(docker.remove_config(&keys).await.unwrap());
        assert_eq!(docker.read_config().await.unwrap(), json!({"runtimes": {}}));
    }
}
