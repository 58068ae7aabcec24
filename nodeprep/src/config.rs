//! Provisioning configuration.
//!
//! [`NodeprepConfig`] is built once, from defaults overlaid with an optional
//! TOML file, and handed to the pipeline constructors. Every section and
//! field has a default, so a file only needs the keys it changes:
//!
//! ```toml
//! [sources]
//! mirrors = ["https://mirrors.tuna.tsinghua.edu.cn/ubuntu"]
//!
//! [verification]
//! schedule_secs = [30, 90]
//! ```

use crate::capabilities::{HostPaths, ScriptSource};
use crate::errors::NodeprepError;
use crate::pipeline::PollPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeprepConfig {
    /// Distribution package mirrors.
    pub sources: SourcesConfig,
    /// Container runtime installation and daemon settings.
    pub container_runtime: ContainerRuntimeConfig,
    /// Accelerator container toolkit.
    pub toolkit: ToolkitConfig,
    /// Cluster runtime.
    pub cluster: ClusterConfig,
    /// Accelerator device plugin.
    pub plugin: PluginConfig,
    /// End-to-end validation workload.
    pub verification: VerificationConfig,
    /// Host files.
    pub host: HostConfig,
}

/// Distribution package mirrors, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Sources file holding the managed mirror block.
    pub file: PathBuf,
    /// Mirror base URLs; the first is primary.
    pub mirrors: Vec<String>,
    /// Release codename; read from the host when unset.
    pub release: Option<String>,
    /// Archive components.
    pub components: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/etc/apt/sources.list.d/nodeprep-mirror.list"),
            mirrors: vec![
                "http://archive.ubuntu.com/ubuntu".into(),
                "https://mirrors.aliyun.com/ubuntu".into(),
                "https://mirrors.tuna.tsinghua.edu.cn/ubuntu".into(),
            ],
            release: None,
            components: vec![
                "main".into(),
                "restricted".into(),
                "universe".into(),
                "multiverse".into(),
            ],
        }
    }
}

/// Container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    /// Distribution package installed first.
    pub package: String,
    /// Installer scripts tried when the package install fails.
    pub install_scripts: Vec<ScriptSource>,
    /// Daemon configuration file.
    pub daemon_config: PathBuf,
    /// Registry mirrors merged into the daemon configuration.
    pub registry_mirrors: Vec<String>,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            package: "docker.io".into(),
            install_scripts: vec![
                ScriptSource::new("https://get.docker.com"),
                ScriptSource::new("https://get.docker.com")
                    .with_arg("--mirror")
                    .with_arg("Aliyun"),
            ],
            daemon_config: PathBuf::from("/etc/docker/daemon.json"),
            registry_mirrors: Vec::new(),
        }
    }
}

/// Accelerator container toolkit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Toolkit package.
    pub package: String,
    /// Sources file for the toolkit repository.
    pub repo_list: PathBuf,
    /// Repository base URLs; the first is primary.
    pub repo_mirrors: Vec<String>,
    /// Keyring the repository signing key is written to.
    pub keyring: PathBuf,
    /// Runtime name registered with the daemon.
    pub runtime_name: String,
    /// Runtime binary registered with the daemon.
    pub runtime_path: String,
    /// Make the accelerator runtime the daemon default.
    pub set_default_runtime: bool,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            package: "nvidia-container-toolkit".into(),
            repo_list: PathBuf::from("/etc/apt/sources.list.d/nvidia-container-toolkit.list"),
            repo_mirrors: vec![
                "https://nvidia.github.io/libnvidia-container".into(),
                "https://mirrors.ustc.edu.cn/libnvidia-container".into(),
            ],
            keyring: PathBuf::from("/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg"),
            runtime_name: "nvidia".into(),
            runtime_path: "nvidia-container-runtime".into(),
            set_default_runtime: true,
        }
    }
}

/// Cluster runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Installer scripts, tried in order.
    pub install_scripts: Vec<ScriptSource>,
    /// Run workloads on the host container runtime instead of the bundled one.
    pub use_docker: bool,
    /// Admin kubeconfig written by the runtime.
    pub kubeconfig_source: PathBuf,
    /// Client kubeconfig location; `~/.kube/config` when unset.
    pub kubeconfig_target: Option<PathBuf>,
    /// Uninstall script left by the installer.
    pub uninstall_script: PathBuf,
    /// Node name; the host name when unset.
    pub node_name: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            install_scripts: vec![
                ScriptSource::new("https://get.k3s.io"),
                ScriptSource::new("https://rancher-mirror.rancher.cn/k3s/k3s-install.sh")
                    .with_env("INSTALL_K3S_MIRROR", "cn"),
            ],
            use_docker: true,
            kubeconfig_source: PathBuf::from("/etc/rancher/k3s/k3s.yaml"),
            kubeconfig_target: None,
            uninstall_script: PathBuf::from("/usr/local/bin/k3s-uninstall.sh"),
            node_name: None,
        }
    }
}

impl ClusterConfig {
    /// Installer scripts with the runtime selection applied.
    #[must_use]
    pub fn effective_install_scripts(&self) -> Vec<ScriptSource> {
        self.install_scripts
            .iter()
            .cloned()
            .map(|mut script| {
                if self.use_docker {
                    script
                        .env
                        .entry("INSTALL_K3S_EXEC".into())
                        .or_insert_with(|| "--docker".into());
                }
                script
            })
            .collect()
    }

    /// Resolves the client kubeconfig path.
    ///
    /// # Errors
    ///
    /// Returns an error if no target is configured and the home directory
    /// cannot be determined.
    pub fn kubeconfig_target(&self) -> Result<PathBuf, NodeprepError> {
        if let Some(target) = &self.kubeconfig_target {
            return Ok(target.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .ok_or_else(|| NodeprepError::Config("cannot determine home directory".into()))
    }
}

/// Accelerator device plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Manifest URLs, tried in order.
    pub manifests: Vec<String>,
    /// Namespace the plugin runs in.
    pub namespace: String,
    /// Name of the plugin daemonset.
    pub daemonset: String,
    /// Node label key marking the node as accelerated.
    pub node_label_key: String,
    /// Node label value.
    pub node_label_value: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            manifests: vec![
                "https://raw.githubusercontent.com/NVIDIA/k8s-device-plugin/v0.14.5/nvidia-device-plugin.yml".into(),
                "https://cdn.jsdelivr.net/gh/NVIDIA/k8s-device-plugin@v0.14.5/nvidia-device-plugin.yml".into(),
            ],
            namespace: "kube-system".into(),
            daemonset: "nvidia-device-plugin-daemonset".into(),
            node_label_key: "nvidia.com/gpu.present".into(),
            node_label_value: "true".into(),
        }
    }
}

/// End-to-end validation workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Pod name.
    pub pod_name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Image running a short accelerator workload.
    pub image: String,
    /// Waits between status checks, in seconds.
    pub schedule_secs: Vec<u64>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pod_name: "nodeprep-gpu-check".into(),
            namespace: "default".into(),
            image: "nvcr.io/nvidia/k8s/cuda-sample:vectoradd-cuda11.7.1-ubuntu20.04".into(),
            schedule_secs: vec![60, 120],
        }
    }
}

impl VerificationConfig {
    /// The poll policy built from `schedule_secs`.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_secs(&self.schedule_secs)
    }

    /// Manifest for the validation pod.
    #[must_use]
    pub fn pod_manifest(&self) -> String {
        format!(
            "apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: {namespace}
  labels:
    app.kubernetes.io/managed-by: nodeprep
spec:
  restartPolicy: Never
  containers:
    - name: cuda-vectoradd
      image: \"{image}\"
      resources:
        limits:
          nvidia.com/gpu: 1
",
            name = self.pod_name,
            namespace = self.namespace,
            image = self.image,
        )
    }
}

/// Host files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Filesystem table.
    pub fstab: PathBuf,
    /// Kernel swap table.
    pub swaps: PathBuf,
    /// Distribution release information.
    pub os_release: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        let paths = HostPaths::default();
        Self {
            fstab: paths.fstab,
            swaps: paths.swaps,
            os_release: paths.os_release,
        }
    }
}

impl HostConfig {
    /// The paths handed to the host capability.
    #[must_use]
    pub fn paths(&self) -> HostPaths {
        HostPaths {
            fstab: self.fstab.clone(),
            swaps: self.swaps.clone(),
            os_release: self.os_release.clone(),
        }
    }
}

impl NodeprepConfig {
    /// Parses a TOML document over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`NodeprepError::Config`] on syntax errors, unknown sections
    /// or failed validation.
    pub fn from_toml_str(text: &str) -> Result<Self, NodeprepError> {
        let config: Self =
            toml::from_str(text).map_err(|e| NodeprepError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, NodeprepError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NodeprepError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            NodeprepError::Config(msg) => {
                NodeprepError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Loads `path` when given, otherwise returns validated defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, NodeprepError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Checks the constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`NodeprepError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), NodeprepError> {
        fn require(ok: bool, message: &str) -> Result<(), NodeprepError> {
            if ok {
                Ok(())
            } else {
                Err(NodeprepError::Config(message.to_string()))
            }
        }

        require(!self.sources.mirrors.is_empty(), "sources.mirrors must not be empty")?;
        require(
            !self.container_runtime.package.trim().is_empty(),
            "container_runtime.package must not be empty",
        )?;
        require(
            !self.toolkit.repo_mirrors.is_empty(),
            "toolkit.repo_mirrors must not be empty",
        )?;
        require(
            !self.cluster.install_scripts.is_empty(),
            "cluster.install_scripts must not be empty",
        )?;
        require(
            self.cluster
                .install_scripts
                .iter()
                .chain(&self.container_runtime.install_scripts)
                .all(|s| !s.url.trim().is_empty()),
            "install script urls must not be empty",
        )?;
        require(!self.plugin.manifests.is_empty(), "plugin.manifests must not be empty")?;
        require(
            !self.verification.pod_name.trim().is_empty(),
            "verification.pod_name must not be empty",
        )?;

        if self.verification.schedule_secs.is_empty() {
            warn!("verification.schedule_secs is empty; the validation pod is checked once");
        }
        Ok(())
    }
}
