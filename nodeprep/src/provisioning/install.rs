//! The forward pipeline.

use super::names::*;
use super::{action, stage_from_chain, state_probe};
use crate::capabilities::{
    Capabilities, ClusterCli, ManifestSource, PackageSpec, ResourceFilter, SourceEntry,
};
use crate::config::{NodeprepConfig, SourcesConfig, ToolkitConfig, VerificationConfig};
use crate::core::Severity;
use crate::errors::{ActionError, NodeprepError};
use crate::events::EventSink;
use crate::persist;
use crate::pipeline::{MirrorChain, Pipeline, PipelineBuilder, PollOutcome, VerificationPoller};
use crate::stages::{Action, Stage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const MIRROR_BLOCK: &str = "mirror";
pub(crate) const TOOLKIT_BLOCK: &str = "nvidia-container-toolkit";

/// Builds the install pipeline.
///
/// # Errors
///
/// Returns an error if a stage has no configured source or the client
/// kubeconfig target cannot be resolved.
pub fn install_pipeline(
    config: &NodeprepConfig,
    caps: &Capabilities,
    check_privileges: bool,
    sink: Arc<dyn EventSink>,
) -> Result<Pipeline, NodeprepError> {
    let mut builder = PipelineBuilder::new("install").event_sink(sink);

    if check_privileges {
        builder.add_stage(check_privileges_stage(caps))?;
    }
    builder.add_stage(configure_sources_stage(&config.sources, caps)?)?;
    builder.add_stage(verify_driver_stage(caps))?;
    builder.add_stage(disable_swap_stage(caps))?;
    builder.add_stage(container_runtime_stage(config, caps))?;
    builder.add_stage(toolkit_stage(config, caps)?)?;
    builder.add_stage(cluster_runtime_stage(config, caps)?)?;
    builder.add_stage(cluster_client_stage(config)?)?;
    builder.add_stage(plugin_stage(config, caps)?)?;
    builder.add_stage(verification_stage(&config.verification, caps))?;

    Ok(builder.build()?)
}

fn check_privileges_stage(caps: &Capabilities) -> Stage {
    let host = caps.host.clone();
    Stage::new(
        CHECK_PRIVILEGES,
        action("id -u", move || {
            let host = host.clone();
            async move {
                if host.is_privileged().await? {
                    Ok(())
                } else {
                    Err(ActionError::precondition(
                        "not running as root; privileged stages are likely to fail",
                    ))
                }
            }
        }),
    )
    .warn()
}

/// The mirror block for one mirror.
pub(crate) fn mirror_entry(sources: &SourcesConfig, mirror: &str, codename: &str) -> SourceEntry {
    let components = sources.components.join(" ");
    let mirror = mirror.trim_end_matches('/');
    ["", "-updates", "-security"]
        .iter()
        .fold(SourceEntry::new(MIRROR_BLOCK, &sources.file), |entry, suffix| {
            entry.with_line(format!("deb {mirror} {codename}{suffix} {components}"))
        })
}

/// Writes the mirror block for one mirror and refreshes the index.
struct ConfigureMirror {
    mirror: String,
    sources: SourcesConfig,
    caps: Capabilities,
}

impl fmt::Debug for ConfigureMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigureMirror")
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for ConfigureMirror {
    fn label(&self) -> &str {
        &self.mirror
    }

    async fn run(&self) -> Result<(), ActionError> {
        let codename = match &self.sources.release {
            Some(release) => release.clone(),
            None => self.caps.host.os_codename().await?,
        };
        let entry = mirror_entry(&self.sources, &self.mirror, &codename);
        self.caps.packages.configure_source(&entry).await
    }
}

fn configure_sources_stage(
    sources: &SourcesConfig,
    caps: &Capabilities,
) -> Result<Stage, NodeprepError> {
    let chain = MirrorChain::from_sources(sources.mirrors.iter().cloned(), |mirror| {
        Arc::new(ConfigureMirror {
            mirror,
            sources: sources.clone(),
            caps: caps.clone(),
        }) as Arc<dyn Action>
    });

    let packages = caps.packages.clone();
    let probe_entry = SourceEntry::new(MIRROR_BLOCK, &sources.file);
    Ok(stage_from_chain(CONFIGURE_SOURCES, chain)?
        .with_probe(state_probe(CONFIGURE_SOURCES, move || {
            let packages = packages.clone();
            let entry = probe_entry.clone();
            async move { packages.source_configured(&entry).await }
        }))
        .warn())
}

fn verify_driver_stage(caps: &Capabilities) -> Stage {
    let accelerator = caps.accelerator.clone();
    Stage::new(
        VERIFY_DRIVER,
        action("nvidia-smi", move || {
            let accelerator = accelerator.clone();
            async move {
                let devices = accelerator.query_presence().await?;
                if devices.is_empty() {
                    return Err(ActionError::precondition(
                        "no accelerator visible to the driver",
                    ));
                }
                for device in &devices {
                    info!(%device, "Accelerator detected");
                }
                Ok(())
            }
        }),
    )
    .warn()
}

fn disable_swap_stage(caps: &Capabilities) -> Stage {
    let host = caps.host.clone();
    let probe_host = caps.host.clone();
    Stage::new(
        DISABLE_SWAP,
        action("swapoff -a", move || {
            let host = host.clone();
            async move { host.disable_swap().await }
        }),
    )
    .with_probe(state_probe(DISABLE_SWAP, move || {
        let host = probe_host.clone();
        async move { Ok(!host.swap_active().await?) }
    }))
    .warn()
}

fn container_runtime_stage(config: &NodeprepConfig, caps: &Capabilities) -> Stage {
    let runtime_config = &config.container_runtime;

    let packages = caps.packages.clone();
    let package = PackageSpec::new(&runtime_config.package);
    let primary = action(format!("apt:{package}"), move || {
        let packages = packages.clone();
        let package = package.clone();
        async move { packages.install(&package).await }
    });

    let fallbacks = MirrorChain::from_sources(runtime_config.install_scripts.iter().cloned(), |script| {
        let runtime = caps.runtime.clone();
        action(script.to_string(), move || {
            let runtime = runtime.clone();
            let script = script.clone();
            async move { runtime.install(&script).await }
        })
    });

    let runtime = caps.runtime.clone();
    Stage::new(INSTALL_CONTAINER_RUNTIME, primary)
        .with_fallbacks(fallbacks)
        .with_probe(state_probe(INSTALL_CONTAINER_RUNTIME, move || {
            let runtime = runtime.clone();
            async move { runtime.is_installed().await }
        }))
        .with_severity(Severity::Fatal)
}

/// Daemon settings registering the accelerator runtime.
#[must_use]
pub fn toolkit_settings(config: &NodeprepConfig) -> Value {
    let toolkit = &config.toolkit;
    let mut settings = json!({
        "runtimes": {
            toolkit.runtime_name.as_str(): {
                "path": toolkit.runtime_path,
                "runtimeArgs": [],
            }
        }
    });
    if toolkit.set_default_runtime {
        settings["default-runtime"] = json!(toolkit.runtime_name);
    }
    if !config.container_runtime.registry_mirrors.is_empty() {
        settings["registry-mirrors"] = json!(config.container_runtime.registry_mirrors);
    }
    settings
}

/// The toolkit repository block for one mirror.
pub(crate) fn toolkit_entry(toolkit: &ToolkitConfig, mirror: &str) -> SourceEntry {
    let mirror = mirror.trim_end_matches('/');
    SourceEntry::new(TOOLKIT_BLOCK, &toolkit.repo_list)
        .with_line(format!(
            "deb [signed-by={}] {mirror}/stable/deb/$(ARCH) /",
            toolkit.keyring.display()
        ))
        .with_key(format!("{mirror}/gpgkey"), &toolkit.keyring)
}

/// Installs the toolkit from one repository mirror and registers its runtime.
struct InstallToolkit {
    mirror: String,
    toolkit: ToolkitConfig,
    settings: Value,
    caps: Capabilities,
}

impl fmt::Debug for InstallToolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallToolkit")
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for InstallToolkit {
    fn label(&self) -> &str {
        &self.mirror
    }

    async fn run(&self) -> Result<(), ActionError> {
        let entry = toolkit_entry(&self.toolkit, &self.mirror);
        self.caps.packages.configure_source(&entry).await?;
        self.caps
            .packages
            .install(&PackageSpec::new(&self.toolkit.package))
            .await?;

        let changed = self.caps.runtime.write_config(&self.settings).await?;
        let registered = match self.caps.runtime.runtime_info().await {
            Ok(info) => info.has_runtime(&self.toolkit.runtime_name),
            Err(err) => {
                debug!(error = %err, "Runtime info unavailable");
                false
            }
        };
        if changed || !registered {
            self.caps.runtime.restart().await?;
        }
        Ok(())
    }
}

fn toolkit_stage(config: &NodeprepConfig, caps: &Capabilities) -> Result<Stage, NodeprepError> {
    let settings = toolkit_settings(config);
    let chain = MirrorChain::from_sources(config.toolkit.repo_mirrors.iter().cloned(), |mirror| {
        Arc::new(InstallToolkit {
            mirror,
            toolkit: config.toolkit.clone(),
            settings: settings.clone(),
            caps: caps.clone(),
        }) as Arc<dyn Action>
    });

    let packages = caps.packages.clone();
    let runtime = caps.runtime.clone();
    let package = config.toolkit.package.clone();
    Ok(stage_from_chain(INSTALL_ACCELERATOR_TOOLKIT, chain)?
        .with_dependency(INSTALL_CONTAINER_RUNTIME)
        .with_probe(state_probe(INSTALL_ACCELERATOR_TOOLKIT, move || {
            let packages = packages.clone();
            let runtime = runtime.clone();
            let package = package.clone();
            let settings = settings.clone();
            async move {
                if !packages.is_installed(&package).await? {
                    return Ok(false);
                }
                let current = runtime.read_config().await?;
                Ok(persist::json_contains(&current, &settings))
            }
        }))
        .warn())
}

fn cluster_runtime_stage(
    config: &NodeprepConfig,
    caps: &Capabilities,
) -> Result<Stage, NodeprepError> {
    let chain = MirrorChain::from_sources(config.cluster.effective_install_scripts(), |script| {
        let cluster = caps.cluster.clone();
        action(script.to_string(), move || {
            let cluster = cluster.clone();
            let script = script.clone();
            async move { cluster.install_runtime(&script).await }
        })
    });

    let cluster = caps.cluster.clone();
    Ok(stage_from_chain(INSTALL_CLUSTER_RUNTIME, chain)?
        .with_dependency(INSTALL_CONTAINER_RUNTIME)
        .with_probe(state_probe(INSTALL_CLUSTER_RUNTIME, move || {
            let cluster = cluster.clone();
            async move { cluster.is_installed().await }
        })))
}

fn cluster_client_stage(config: &NodeprepConfig) -> Result<Stage, NodeprepError> {
    let source = config.cluster.kubeconfig_source.clone();
    let target = config.cluster.kubeconfig_target()?;

    let (probe_source, probe_target) = (source.clone(), target.clone());
    let probe = state_probe(CONFIGURE_CLUSTER_CLIENT, move || {
        let (source, target) = (probe_source.clone(), probe_target.clone());
        async move {
            let Some(wanted) = persist::file_digest(&source)? else {
                return Err(ActionError::precondition(format!(
                    "{} does not exist yet",
                    source.display()
                )));
            };
            Ok(persist::file_digest(&target)?.as_deref() == Some(wanted.as_str()))
        }
    });

    Ok(Stage::new(
        CONFIGURE_CLUSTER_CLIENT,
        action(source.display().to_string(), move || {
            let (source, target) = (source.clone(), target.clone());
            async move { copy_kubeconfig(&source, &target) }
        }),
    )
    .with_dependency(INSTALL_CLUSTER_RUNTIME)
    .with_probe(probe)
    .warn())
}

fn copy_kubeconfig(source: &Path, target: &Path) -> Result<(), ActionError> {
    if persist::copy_if_changed(source, target)? {
        info!(path = %target.display(), "Wrote client kubeconfig");
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Labels the node and applies the device plugin from one manifest URL.
struct InstallPlugin {
    url: String,
    node_name: Option<String>,
    label: (String, String),
    caps: Capabilities,
}

impl fmt::Debug for InstallPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallPlugin")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for InstallPlugin {
    fn label(&self) -> &str {
        &self.url
    }

    async fn run(&self) -> Result<(), ActionError> {
        let node = match &self.node_name {
            Some(name) => name.clone(),
            None => self.caps.host.hostname().await?,
        };
        let (key, value) = &self.label;
        self.caps.cluster.label_node(&node, key, value).await?;
        self.caps
            .cluster
            .apply_manifest(&ManifestSource::Url(self.url.clone()))
            .await
    }
}

fn plugin_stage(config: &NodeprepConfig, caps: &Capabilities) -> Result<Stage, NodeprepError> {
    let plugin = &config.plugin;
    let chain = MirrorChain::from_sources(plugin.manifests.iter().cloned(), |url| {
        Arc::new(InstallPlugin {
            url,
            node_name: config.cluster.node_name.clone(),
            label: (plugin.node_label_key.clone(), plugin.node_label_value.clone()),
            caps: caps.clone(),
        }) as Arc<dyn Action>
    });

    let cluster = caps.cluster.clone();
    let filter = ResourceFilter::kind("daemonset")
        .in_namespace(&plugin.namespace)
        .named(&plugin.daemonset);
    Ok(stage_from_chain(INSTALL_ACCELERATOR_PLUGIN, chain)?
        .with_dependency(INSTALL_CLUSTER_RUNTIME)
        .with_dependency(INSTALL_ACCELERATOR_TOOLKIT)
        .with_probe(state_probe(INSTALL_ACCELERATOR_PLUGIN, move || {
            let cluster = cluster.clone();
            let filter = filter.clone();
            async move { Ok(!cluster.list_resources(&filter).await?.is_empty()) }
        }))
        .warn())
}

/// Runs the validation pod and waits for it to finish.
pub(crate) struct VerifyWorkload {
    config: VerificationConfig,
    cluster: Arc<dyn ClusterCli>,
    poller: VerificationPoller,
}

impl VerifyWorkload {
    pub(crate) fn new(config: VerificationConfig, cluster: Arc<dyn ClusterCli>) -> Self {
        let poller = VerificationPoller::new(config.poll_policy());
        Self {
            config,
            cluster,
            poller,
        }
    }
}

impl fmt::Debug for VerifyWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyWorkload")
            .field("pod", &self.config.pod_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for VerifyWorkload {
    fn label(&self) -> &str {
        &self.config.pod_name
    }

    async fn run(&self) -> Result<(), ActionError> {
        let pod = &self.config.pod_name;
        let namespace = &self.config.namespace;

        if let Err(err) = self.cluster.delete_resource("pod", pod, namespace).await {
            debug!(error = %err, "Could not remove previous validation pod");
        }
        self.cluster
            .apply_manifest(&ManifestSource::Inline(self.config.pod_manifest()))
            .await?;

        let filter = ResourceFilter::kind("pod")
            .in_namespace(namespace.as_str())
            .named(pod.as_str());
        let phase: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let outcome = self
            .poller
            .poll(|| {
                let cluster = self.cluster.clone();
                let filter = filter.clone();
                let phase = phase.clone();
                async move {
                    match cluster.list_resources(&filter).await {
                        Ok(items) => {
                            let current = items.into_iter().next().and_then(|item| item.phase);
                            debug!(phase = ?current, "Validation pod status");
                            let finished =
                                matches!(current.as_deref(), Some("Succeeded" | "Failed"));
                            *phase.lock() = current;
                            finished
                        }
                        Err(err) => {
                            debug!(error = %err, "Could not read validation pod status");
                            false
                        }
                    }
                }
            })
            .await;

        let last_phase = phase.lock().clone();
        match (outcome, last_phase.as_deref()) {
            (PollOutcome::Success { checks }, Some("Succeeded")) => {
                info!(checks, "Validation workload succeeded");
                match self.cluster.fetch_logs(pod, namespace).await {
                    Ok(logs) => info!(logs = %logs.trim(), "Validation workload output"),
                    Err(err) => warn!(error = %err, "Could not fetch validation workload logs"),
                }
                Ok(())
            }
            (PollOutcome::Success { .. }, _) => {
                let logs = self
                    .cluster
                    .fetch_logs(pod, namespace)
                    .await
                    .unwrap_or_default();
                Err(ActionError::Other(format!(
                    "validation pod {pod} failed: {}",
                    logs.trim()
                )))
            }
            (PollOutcome::TimedOut { checks }, _) => {
                debug!(phase = ?last_phase, "Validation pod did not finish");
                Err(ActionError::TimedOut { checks })
            }
        }
    }
}

fn verification_stage(config: &VerificationConfig, caps: &Capabilities) -> Stage {
    Stage::new(
        VERIFY_END_TO_END,
        Arc::new(VerifyWorkload::new(config.clone(), caps.cluster.clone())),
    )
    .with_dependency(INSTALL_ACCELERATOR_PLUGIN)
    .warn()
}
