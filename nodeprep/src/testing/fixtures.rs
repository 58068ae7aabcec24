//! A simulated node for end-to-end pipeline tests.
//!
//! [`FakeNode`] answers every command the capability backends issue and
//! keeps just enough state for probes to observe what earlier actions did.
//! [`TempNode`] roots all persisted files in a temporary directory so the
//! real [`Capabilities`] can run against it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use super::mocks::Journal;
use crate::capabilities::{Capabilities, CommandOutput, CommandRunner, CommandSpec, Fetcher};
use crate::config::NodeprepConfig;
use crate::errors::ActionError;
use crate::persist;

/// One device in `nvidia-smi` CSV form.
pub const SAMPLE_GPU_CSV: &str = "0, NVIDIA A100-SXM4-40GB, 40960 MiB, 0 MiB, 0 %, 34\n";

/// Host name the fake node reports.
pub const FAKE_HOSTNAME: &str = "gpu-node-1";

#[derive(Debug, Default)]
struct NodeState {
    packages: BTreeSet<String>,
    docker: bool,
    k3s: bool,
    plugin: bool,
    pod_phase: Option<String>,
    registered_runtimes: BTreeSet<String>,
    restarts: usize,
    labels: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Behavior {
    gpus: Option<String>,
    pod_outcome: String,
    unreachable: Vec<String>,
    failing: Vec<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            gpus: Some(SAMPLE_GPU_CSV.to_string()),
            pod_outcome: "Succeeded".to_string(),
            unreachable: Vec::new(),
            failing: Vec::new(),
        }
    }
}

/// A scripted stand-in for the machine, implementing both
/// [`CommandRunner`] and [`Fetcher`].
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct FakeNode {
    config: Arc<NodeprepConfig>,
    state: Arc<Mutex<NodeState>>,
    behavior: Arc<Mutex<Behavior>>,
    commands: Journal,
    fetches: Journal,
}

impl FakeNode {
    /// Creates a node with nothing installed that reads and writes the
    /// files named in `config`.
    #[must_use]
    pub fn new(config: &NodeprepConfig) -> Self {
        Self {
            config: Arc::new(config.clone()),
            state: Arc::new(Mutex::new(NodeState::default())),
            behavior: Arc::new(Mutex::new(Behavior::default())),
            commands: Journal::default(),
            fetches: Journal::default(),
        }
    }

    /// Makes every URL containing `pattern` unreachable, for downloads,
    /// remote manifests and package mirrors alike.
    pub fn make_unreachable(&self, pattern: impl Into<String>) {
        self.behavior.lock().unreachable.push(pattern.into());
    }

    /// Makes every command whose rendered line contains `pattern` exit 1.
    pub fn fail_commands(&self, pattern: impl Into<String>) {
        self.behavior.lock().failing.push(pattern.into());
    }

    /// Removes all accelerators.
    pub fn without_gpus(&self) {
        self.behavior.lock().gpus = None;
    }

    /// Phase the validation pod reaches once created.
    pub fn set_pod_outcome(&self, phase: impl Into<String>) {
        self.behavior.lock().pod_outcome = phase.into();
    }

    /// Every command line run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.entries()
    }

    /// Command lines containing `pattern`.
    #[must_use]
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|line| line.contains(pattern))
            .collect()
    }

    /// Every URL fetched so far, successful or not.
    #[must_use]
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.entries()
    }

    /// True if the package is installed.
    #[must_use]
    pub fn has_package(&self, name: &str) -> bool {
        self.state.lock().packages.contains(name)
    }

    /// True if the cluster runtime is installed.
    #[must_use]
    pub fn cluster_installed(&self) -> bool {
        self.state.lock().k3s
    }

    /// True if the device plugin is deployed.
    #[must_use]
    pub fn plugin_deployed(&self) -> bool {
        self.state.lock().plugin
    }

    /// Number of container daemon restarts.
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    /// Label value set on this node for `key`.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<String> {
        self.state.lock().labels.get(key).cloned()
    }

    fn is_unreachable(&self, text: &str) -> bool {
        self.behavior
            .lock()
            .unreachable
            .iter()
            .any(|pattern| text.contains(pattern.as_str()))
    }

    fn apt_update(&self) -> CommandOutput {
        let lists = [&self.config.sources.file, &self.config.toolkit.repo_list];
        for list in lists {
            let content = persist::read_or_empty(list).unwrap_or_default();
            for line in content.lines().filter(|l| l.starts_with("deb ")) {
                if self.is_unreachable(line) {
                    return CommandOutput::failed(100, format!("E: Failed to fetch {line}"));
                }
            }
        }
        CommandOutput::ok("Reading package lists... Done\n")
    }

    fn apt_get(&self, args: &[String]) -> CommandOutput {
        let Some(package) = args.last() else {
            return CommandOutput::failed(100, "E: Invalid operation");
        };
        let name = package.split('=').next().unwrap_or(package).to_string();
        let mut state = self.state.lock();
        match args.first().map(String::as_str) {
            Some("install") => {
                if name.starts_with("docker") {
                    state.docker = true;
                }
                state.packages.insert(name);
                CommandOutput::ok("")
            }
            Some("purge") => {
                state.packages.remove(&name);
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(100, "E: Invalid operation"),
        }
    }

    fn dpkg_query(&self, args: &[String]) -> CommandOutput {
        let installed = args
            .last()
            .is_some_and(|name| self.state.lock().packages.contains(name));
        if installed {
            CommandOutput::ok("install ok installed")
        } else {
            CommandOutput::failed(1, "dpkg-query: no packages found")
        }
    }

    fn gpg(spec: &CommandSpec) -> io::Result<CommandOutput> {
        let target = spec
            .args
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|i| spec.args.get(i + 1));
        match target {
            Some(path) => {
                persist::write_atomic(Path::new(path), spec.stdin.as_deref().unwrap_or_default())?;
                Ok(CommandOutput::ok(""))
            }
            None => Ok(CommandOutput::failed(2, "gpg: no output file")),
        }
    }

    fn docker(&self, args: &[String]) -> CommandOutput {
        let state = self.state.lock();
        if !state.docker {
            return CommandOutput::not_found("docker");
        }
        match args.first().map(String::as_str) {
            Some("--version") => CommandOutput::ok("Docker version 24.0.7, build afdd53b\n"),
            Some("info") => {
                let runtimes: serde_json::Map<String, Value> = std::iter::once("runc".to_string())
                    .chain(state.registered_runtimes.iter().cloned())
                    .map(|name| (name, json!({})))
                    .collect();
                CommandOutput::ok(
                    json!({"ServerVersion": "24.0.7", "DefaultRuntime": "runc", "Runtimes": runtimes})
                        .to_string(),
                )
            }
            _ => CommandOutput::failed(1, "unknown docker command"),
        }
    }

    fn restart_docker(&self) -> io::Result<CommandOutput> {
        let daemon = persist::read_json(&self.config.container_runtime.daemon_config)?;
        let mut state = self.state.lock();
        if !state.docker {
            return Ok(CommandOutput::failed(5, "Unit docker.service not found."));
        }
        state.registered_runtimes = daemon
            .get("runtimes")
            .and_then(Value::as_object)
            .map(|runtimes| runtimes.keys().cloned().collect())
            .unwrap_or_default();
        state.restarts += 1;
        Ok(CommandOutput::ok(""))
    }

    fn run_shell(&self, args: &[String]) -> io::Result<CommandOutput> {
        let Some(script) = args.first() else {
            return Ok(CommandOutput::failed(2, "sh: no script"));
        };
        let cluster = &self.config.cluster;

        if Path::new(script) == cluster.uninstall_script {
            let mut state = self.state.lock();
            state.k3s = false;
            state.plugin = false;
            state.pod_phase = None;
            drop(state);
            remove_if_present(&cluster.uninstall_script)?;
            remove_if_present(&cluster.kubeconfig_source)?;
            return Ok(CommandOutput::ok(""));
        }

        let body = std::fs::read_to_string(script)?;
        if body.contains("k3s") {
            persist::write_atomic(&cluster.kubeconfig_source, b"apiVersion: v1\nkind: Config\n")?;
            persist::write_atomic(&cluster.uninstall_script, b"#!/bin/sh\n")?;
            self.state.lock().k3s = true;
        } else {
            self.state.lock().docker = true;
        }
        Ok(CommandOutput::ok(""))
    }

    fn kubectl(&self, args: &[String]) -> CommandOutput {
        // Drop the leading `--kubeconfig <path>`.
        let args: Vec<&str> = args.iter().skip(2).map(String::as_str).collect();
        let pod_outcome = self.behavior.lock().pod_outcome.clone();
        let mut state = self.state.lock();
        if !state.k3s {
            return CommandOutput::failed(1, "The connection to the server was refused");
        }

        match args.as_slice() {
            ["label", "node", node, label, ..] => {
                if *node != FAKE_HOSTNAME {
                    return CommandOutput::failed(1, format!("nodes \"{node}\" not found"));
                }
                if let Some((key, value)) = label.split_once('=') {
                    state.labels.insert(key.to_string(), value.to_string());
                }
                CommandOutput::ok("node/gpu-node-1 labeled\n")
            }
            ["apply", "-f", "-"] => {
                state.pod_phase = Some(pod_outcome);
                CommandOutput::ok("pod/created\n")
            }
            ["apply", "-f", url] => {
                drop(state);
                if self.is_unreachable(url) {
                    return CommandOutput::failed(1, format!("error: unable to read URL \"{url}\""));
                }
                self.state.lock().plugin = true;
                CommandOutput::ok("daemonset.apps/created\n")
            }
            ["delete", "--ignore-not-found", "-f", url] => {
                drop(state);
                if self.is_unreachable(url) {
                    return CommandOutput::failed(1, format!("error: unable to read URL \"{url}\""));
                }
                self.state.lock().plugin = false;
                CommandOutput::ok("")
            }
            ["delete", "pod", ..] => {
                state.pod_phase = None;
                CommandOutput::ok("")
            }
            ["get", kind, rest @ ..] => {
                let name = rest
                    .iter()
                    .find_map(|arg| arg.strip_prefix("metadata.name="))
                    .unwrap_or("unnamed");
                let items = match *kind {
                    "daemonset" if state.plugin => vec![json!({"metadata": {"name": name}})],
                    "pod" => state
                        .pod_phase
                        .iter()
                        .map(|phase| json!({"metadata": {"name": name}, "status": {"phase": phase}}))
                        .collect(),
                    _ => Vec::new(),
                };
                CommandOutput::ok(json!({"items": items}).to_string())
            }
            ["logs", ..] => CommandOutput::ok("[Vector addition of 50000 elements]\nTest PASSED\n"),
            _ => CommandOutput::failed(1, "unknown kubectl command"),
        }
    }

    fn swapoff(&self) -> io::Result<CommandOutput> {
        persist::write_atomic(&self.config.host.swaps, b"Filename\tType\tSize\tUsed\tPriority\n")?;
        Ok(CommandOutput::ok(""))
    }

    fn dispatch(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let args = spec.args.as_slice();
        let output = match spec.program.as_str() {
            "id" => CommandOutput::ok("0\n"),
            "hostname" => CommandOutput::ok(format!("{FAKE_HOSTNAME}\n")),
            "swapoff" => self.swapoff()?,
            "dpkg-query" => self.dpkg_query(args),
            "apt-get" if spec.has_args_prefix(&["update"]) => self.apt_update(),
            "apt-get" => self.apt_get(args),
            "gpg" => Self::gpg(spec)?,
            "docker" => self.docker(args),
            "systemctl" if spec.has_args_prefix(&["restart", "docker"]) => self.restart_docker()?,
            "nvidia-smi" => match &self.behavior.lock().gpus {
                Some(csv) => CommandOutput::ok(csv.clone()),
                None => CommandOutput::failed(6, "No devices were found"),
            },
            "k3s" if self.state.lock().k3s => CommandOutput::ok("k3s version v1.28.5+k3s1\n"),
            "sh" => self.run_shell(args)?,
            "kubectl" => self.kubectl(args),
            program => CommandOutput::not_found(program),
        };
        Ok(output)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl CommandRunner for FakeNode {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ActionError> {
        let line = spec.to_string();
        self.commands.push(line.clone());

        let failing = self
            .behavior
            .lock()
            .failing
            .iter()
            .any(|pattern| line.contains(pattern.as_str()));
        if failing {
            return Ok(CommandOutput::failed(1, "simulated failure"));
        }
        Ok(self.dispatch(spec)?)
    }
}

#[async_trait]
impl Fetcher for FakeNode {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ActionError> {
        self.fetches.push(url);
        if self.is_unreachable(url) {
            return Err(ActionError::download(url, "connection timed out"));
        }
        Ok(format!("#!/bin/sh\n# fetched from {url}\n").into_bytes())
    }
}

/// A [`FakeNode`] whose persisted state lives in a temporary directory.
#[derive(Debug)]
pub struct TempNode {
    dir: TempDir,
    /// Configuration pointing every managed file into the directory.
    pub config: NodeprepConfig,
    /// The simulated machine.
    pub node: FakeNode,
}

impl TempNode {
    /// Creates a node with swap enabled and nothing installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or seed files cannot be created.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("etc"))?;

        let mut config = NodeprepConfig::default();
        config.sources.file = root.join("etc/nodeprep-mirror.list");
        config.toolkit.repo_list = root.join("etc/nvidia-container-toolkit.list");
        config.toolkit.keyring = root.join("etc/keyrings/nvidia-container-toolkit.gpg");
        config.container_runtime.daemon_config = root.join("etc/docker/daemon.json");
        config.cluster.kubeconfig_source = root.join("etc/rancher/k3s/k3s.yaml");
        config.cluster.kubeconfig_target = Some(root.join("home/.kube/config"));
        config.cluster.uninstall_script = root.join("usr/local/bin/k3s-uninstall.sh");
        config.host.fstab = root.join("etc/fstab");
        config.host.swaps = root.join("proc-swaps");
        config.host.os_release = root.join("etc/os-release");

        std::fs::write(
            &config.host.fstab,
            "UUID=abcd / ext4 errors=remount-ro 0 1\n/swap.img none swap sw 0 0\n",
        )?;
        std::fs::write(
            &config.host.swaps,
            "Filename\tType\tSize\tUsed\tPriority\n/swap.img file 2097148 0 -2\n",
        )?;
        std::fs::write(
            &config.host.os_release,
            "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nVERSION_CODENAME=jammy\n",
        )?;

        let node = FakeNode::new(&config);
        Ok(Self { dir, config, node })
    }

    /// Root of the temporary directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Capabilities backed by the real implementations over the fake node.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::with_backends(
            &self.config,
            Arc::new(self.node.clone()),
            Arc::new(self.node.clone()),
        )
    }

    /// Digests of every managed file, keyed by path.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read.
    pub fn snapshot(&self) -> io::Result<BTreeMap<PathBuf, Option<String>>> {
        let files = [
            &self.config.sources.file,
            &self.config.toolkit.repo_list,
            &self.config.toolkit.keyring,
            &self.config.container_runtime.daemon_config,
            &self.config.host.fstab,
            &self.config.host.swaps,
        ];
        files
            .into_iter()
            .map(|path| Ok((path.clone(), persist::file_digest(path)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_fake_node_tracks_packages() {
        let temp = TempNode::new().unwrap();
        let node = &temp.node;

        let query = CommandSpec::new("dpkg-query").arg("docker.io");
        assert!(!node.run(&query).await.unwrap().success());

        let install = CommandSpec::new("apt-get").args(["install", "-y", "docker.io"]);
        assert!(node.run(&install).await.unwrap().success());
        assert!(node.run(&query).await.unwrap().success());
        assert!(node.has_package("docker.io"));
        assert_eq!(node.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_fake_node_failure_injection() {
        let temp = TempNode::new().unwrap();
        temp.node.make_unreachable("get.docker.com");
        temp.node.fail_commands("apt-get install");

        assert!(temp.node.fetch("https://get.docker.com").await.is_err());
        assert!(temp.node.fetch("https://get.k3s.io").await.is_ok());
        let install = CommandSpec::new("apt-get").args(["install", "-y", "docker.io"]);
        assert!(!temp.node.run(&install).await.unwrap().success());
        assert_eq!(temp.node.fetches().len(), 2);
    }

    #[tokio::test]
    async fn test_kubectl_requires_cluster() {
        let temp = TempNode::new().unwrap();
        let get = CommandSpec::new("kubectl").args(["--kubeconfig", "x", "get", "pod"]);
        assert!(!temp.node.run(&get).await.unwrap().success());
    }
}
