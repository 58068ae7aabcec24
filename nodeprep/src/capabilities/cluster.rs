//! Cluster runtime and its control-plane CLI.

use super::command::{run_checked, CommandRunner, CommandSpec};
use super::fetch::Fetcher;
use super::script::{run_script, ScriptSource};
use crate::errors::ActionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// A remote manifest.
    Url(String),
    /// Manifest text held in memory.
    Inline(String),
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Inline(_) => f.write_str("<inline manifest>"),
        }
    }
}

/// Selects resources of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    /// Resource kind, e.g. `pod` or `daemonset`.
    pub kind: String,
    /// Namespace; all namespaces when `None`.
    pub namespace: Option<String>,
    /// Exact resource name.
    pub name: Option<String>,
    /// Label selector.
    pub label_selector: Option<String>,
}

impl ResourceFilter {
    /// Selects every resource of `kind`.
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Restricts to a namespace.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restricts to one name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restricts by label selector.
    #[must_use]
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// The fields of a listed resource that stages look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Resource name.
    pub name: String,
    /// Namespace, for namespaced kinds.
    pub namespace: Option<String>,
    /// `status.phase`, for kinds that have one.
    pub phase: Option<String>,
}

#[derive(Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<RawResource>,
}

#[derive(Deserialize)]
struct RawResource {
    metadata: RawMetadata,
    #[serde(default)]
    status: Option<RawStatus>,
}

#[derive(Deserialize)]
struct RawMetadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(default)]
    phase: Option<String>,
}

/// Decodes `kubectl get -o json` list output.
pub fn parse_resource_list(json: &str) -> Result<Vec<ResourceSummary>, ActionError> {
    let list: ResourceList =
        serde_json::from_str(json).map_err(|e| ActionError::parse("kubectl get", e.to_string()))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| ResourceSummary {
            name: item.metadata.name,
            namespace: item.metadata.namespace,
            phase: item.status.and_then(|s| s.phase),
        })
        .collect())
}

/// The cluster runtime and its CLI.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterCli: Send + Sync {
    /// Returns true if the cluster runtime is installed.
    async fn is_installed(&self) -> Result<bool, ActionError>;

    /// Installs the runtime with a remote installer script.
    async fn install_runtime(&self, script: &ScriptSource) -> Result<(), ActionError>;

    /// Removes the runtime.
    async fn uninstall_runtime(&self) -> Result<(), ActionError>;

    /// Creates or updates the objects in a manifest.
    async fn apply_manifest(&self, source: &ManifestSource) -> Result<(), ActionError>;

    /// Deletes the objects in a manifest; missing objects are fine.
    async fn delete_manifest(&self, source: &ManifestSource) -> Result<(), ActionError>;

    /// Lists resources matching `filter`.
    async fn list_resources(&self, filter: &ResourceFilter)
        -> Result<Vec<ResourceSummary>, ActionError>;

    /// Sets `key=value` on a node, overwriting any previous value.
    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ActionError>;

    /// Returns the logs of a pod.
    async fn fetch_logs(&self, pod: &str, namespace: &str) -> Result<String, ActionError>;

    /// Deletes one resource; a missing resource is fine.
    async fn delete_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), ActionError>;
}

/// [`ClusterCli`] for a k3s single-node cluster.
#[derive(Clone)]
pub struct K3sCluster {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
    kubeconfig: PathBuf,
    uninstall_script: PathBuf,
}

impl K3sCluster {
    /// Creates a handle that talks to the cluster through `kubeconfig`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn Fetcher>,
        kubeconfig: impl Into<PathBuf>,
        uninstall_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            fetcher,
            kubeconfig: kubeconfig.into(),
            uninstall_script: uninstall_script.into(),
        }
    }

    fn kubectl(&self) -> CommandSpec {
        CommandSpec::new("kubectl")
            .arg("--kubeconfig")
            .arg(self.kubeconfig.to_string_lossy())
    }

    fn with_manifest(spec: CommandSpec, source: &ManifestSource) -> CommandSpec {
        match source {
            ManifestSource::Url(url) => spec.args(["-f", url.as_str()]),
            ManifestSource::Inline(text) => spec.args(["-f", "-"]).stdin(text.as_bytes()),
        }
    }
}

impl fmt::Debug for K3sCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K3sCluster")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterCli for K3sCluster {
    async fn is_installed(&self) -> Result<bool, ActionError> {
        let output = self
            .runner
            .run(&CommandSpec::new("k3s").arg("--version"))
            .await?;
        Ok(output.success())
    }

    async fn install_runtime(&self, script: &ScriptSource) -> Result<(), ActionError> {
        run_script(self.fetcher.as_ref(), self.runner.as_ref(), script).await
    }

    async fn uninstall_runtime(&self) -> Result<(), ActionError> {
        if !self.uninstall_script.exists() {
            return Err(ActionError::precondition(format!(
                "uninstall script {} not found",
                self.uninstall_script.display()
            )));
        }
        info!(script = %self.uninstall_script.display(), "Uninstalling cluster runtime");
        let spec = CommandSpec::new("sh").arg(self.uninstall_script.to_string_lossy());
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn apply_manifest(&self, source: &ManifestSource) -> Result<(), ActionError> {
        debug!(manifest = %source, "Applying manifest");
        let spec = Self::with_manifest(self.kubectl().arg("apply"), source);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn delete_manifest(&self, source: &ManifestSource) -> Result<(), ActionError> {
        debug!(manifest = %source, "Deleting manifest");
        let spec = Self::with_manifest(
            self.kubectl().args(["delete", "--ignore-not-found"]),
            source,
        );
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceSummary>, ActionError> {
        let mut spec = self.kubectl().args(["get", filter.kind.as_str()]);
        spec = match &filter.namespace {
            Some(ns) => spec.args(["-n", ns.as_str()]),
            None => spec.arg("--all-namespaces"),
        };
        if let Some(name) = &filter.name {
            spec = spec.arg("--field-selector").arg(format!("metadata.name={name}"));
        }
        if let Some(selector) = &filter.label_selector {
            spec = spec.args(["-l", selector.as_str()]);
        }
        let stdout = run_checked(self.runner.as_ref(), &spec.args(["-o", "json"])).await?;
        parse_resource_list(&stdout)
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ActionError> {
        let spec = self
            .kubectl()
            .args(["label", "node", node])
            .arg(format!("{key}={value}"))
            .arg("--overwrite");
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn fetch_logs(&self, pod: &str, namespace: &str) -> Result<String, ActionError> {
        let spec = self.kubectl().args(["logs", pod, "-n", namespace]);
        run_checked(self.runner.as_ref(), &spec).await
    }

    async fn delete_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), ActionError> {
        let spec = self
            .kubectl()
            .args(["delete", kind, name, "-n", namespace, "--ignore-not-found"]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::command::{CommandOutput, MockCommandRunner};
    use crate::capabilities::fetch::MockFetcher;
    use pretty_assertions::assert_eq;

    fn cluster(runner: MockCommandRunner) -> K3sCluster {
        K3sCluster::new(
            Arc::new(runner),
            Arc::new(MockFetcher::new()),
            "/etc/rancher/k3s/k3s.yaml",
            "/usr/local/bin/k3s-uninstall.sh",
        )
    }

    #[test]
    fn test_parse_resource_list() {
        let json = r#"{
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"metadata": {"name": "gpu-check", "namespace": "default"}, "status": {"phase": "Succeeded"}},
                {"metadata": {"name": "nvidia-device-plugin-daemonset", "namespace": "kube-system"}, "status": {"numberReady": 1}}
            ]
        }"#;

        let items = parse_resource_list(json).unwrap();
        assert_eq!(
            items,
            vec![
                ResourceSummary {
                    name: "gpu-check".into(),
                    namespace: Some("default".into()),
                    phase: Some("Succeeded".into()),
                },
                ResourceSummary {
                    name: "nvidia-device-plugin-daemonset".into(),
                    namespace: Some("kube-system".into()),
                    phase: None,
                },
            ]
        );
        assert!(parse_resource_list(r#"{"items": []}"#).unwrap().is_empty());
        assert!(parse_resource_list("error: the server doesn't have a resource type").is_err());
    }

    #[tokio::test]
    async fn test_list_resources_builds_query() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.args
                    == [
                        "--kubeconfig",
                        "/etc/rancher/k3s/k3s.yaml",
                        "get",
                        "pod",
                        "-n",
                        "default",
                        "--field-selector",
                        "metadata.name=gpu-check",
                        "-o",
                        "json",
                    ]
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok(r#"{"items": []}"#)));

        let filter = ResourceFilter::kind("pod").in_namespace("default").named("gpu-check");
        assert!(cluster(runner).list_resources(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_inline_manifest_uses_stdin() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.args.ends_with(&["apply".to_string(), "-f".to_string(), "-".to_string()])
                    && spec.stdin.as_deref() == Some(b"kind: Pod\n".as_slice())
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("pod/gpu-check created")));

        cluster(runner)
            .apply_manifest(&ManifestSource::Inline("kind: Pod\n".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_label_node_overwrites() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.args.ends_with(&["nvidia.com/gpu.present=true".to_string(), "--overwrite".to_string()]))
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("node/gpu-node labeled")));

        cluster(runner)
            .label_node("gpu-node", "nvidia.com/gpu.present", "true")
            .await
            .unwrap();
    }
}
