//! The teardown pipeline.
//!
//! Every stage is best effort and its probe reports satisfied once the
//! component is gone, so a second cleanup run skips everything.

use super::install::{MIRROR_BLOCK, TOOLKIT_BLOCK};
use super::names::*;
use super::{action, stage_from_chain, state_probe};
use crate::capabilities::{Capabilities, ClusterCli, ManifestSource, ResourceFilter, SourceEntry};
use crate::config::{NodeprepConfig, ToolkitConfig};
use crate::core::Severity;
use crate::errors::{ActionError, NodeprepError};
use crate::events::EventSink;
use crate::persist::{self, KeyPath};
use crate::pipeline::{MirrorChain, Pipeline, PipelineBuilder};
use crate::stages::{Action, Stage};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds the cleanup pipeline.
///
/// # Errors
///
/// Returns an error if no device plugin manifest is configured.
pub fn cleanup_pipeline(
    config: &NodeprepConfig,
    caps: &Capabilities,
    sink: Arc<dyn EventSink>,
) -> Result<Pipeline, NodeprepError> {
    let mut builder = PipelineBuilder::new("cleanup")
        .default_severity(Severity::Warn)
        .event_sink(sink);

    builder.add_stage(remove_workload_stage(config, caps))?;
    builder.add_stage(remove_plugin_stage(config, caps)?)?;
    builder.add_stage(uninstall_cluster_stage(caps))?;
    builder.add_stage(remove_toolkit_settings_stage(&config.toolkit, caps))?;
    builder.add_stage(remove_toolkit_source_stage(&config.toolkit, caps))?;
    builder.add_stage(remove_mirror_source_stage(config, caps))?;

    Ok(builder.build()?)
}

/// True when nothing matches `filter`, or there is no cluster to ask.
async fn cluster_lacks(cluster: &dyn ClusterCli, filter: &ResourceFilter) -> Result<bool, ActionError> {
    if !cluster.is_installed().await? {
        return Ok(true);
    }
    Ok(cluster.list_resources(filter).await?.is_empty())
}

fn remove_workload_stage(config: &NodeprepConfig, caps: &Capabilities) -> Stage {
    let verification = config.verification.clone();
    let filter = ResourceFilter::kind("pod")
        .in_namespace(&verification.namespace)
        .named(&verification.pod_name);

    let cluster = caps.cluster.clone();
    let probe_cluster = caps.cluster.clone();
    Stage::new(
        REMOVE_VALIDATION_WORKLOAD,
        action(verification.pod_name.clone(), move || {
            let cluster = cluster.clone();
            let verification = verification.clone();
            async move {
                cluster
                    .delete_resource("pod", &verification.pod_name, &verification.namespace)
                    .await
            }
        }),
    )
    .with_probe(state_probe(REMOVE_VALIDATION_WORKLOAD, move || {
        let cluster = probe_cluster.clone();
        let filter = filter.clone();
        async move { cluster_lacks(cluster.as_ref(), &filter).await }
    }))
}

fn remove_plugin_stage(config: &NodeprepConfig, caps: &Capabilities) -> Result<Stage, NodeprepError> {
    let plugin = &config.plugin;
    let chain = MirrorChain::from_sources(plugin.manifests.iter().cloned(), |url| {
        let cluster = caps.cluster.clone();
        action(url.clone(), move || {
            let cluster = cluster.clone();
            let manifest = ManifestSource::Url(url.clone());
            async move { cluster.delete_manifest(&manifest).await }
        })
    });

    let cluster = caps.cluster.clone();
    let filter = ResourceFilter::kind("daemonset")
        .in_namespace(&plugin.namespace)
        .named(&plugin.daemonset);
    Ok(stage_from_chain(REMOVE_ACCELERATOR_PLUGIN, chain)?.with_probe(state_probe(
        REMOVE_ACCELERATOR_PLUGIN,
        move || {
            let cluster = cluster.clone();
            let filter = filter.clone();
            async move { cluster_lacks(cluster.as_ref(), &filter).await }
        },
    )))
}

fn uninstall_cluster_stage(caps: &Capabilities) -> Stage {
    let cluster = caps.cluster.clone();
    let probe_cluster = caps.cluster.clone();
    Stage::new(
        UNINSTALL_CLUSTER_RUNTIME,
        action("k3s-uninstall.sh", move || {
            let cluster = cluster.clone();
            async move { cluster.uninstall_runtime().await }
        }),
    )
    .with_probe(state_probe(UNINSTALL_CLUSTER_RUNTIME, move || {
        let cluster = probe_cluster.clone();
        async move { Ok(!cluster.is_installed().await?) }
    }))
}

/// Daemon configuration keys registered for `toolkit` that are present in `current`.
#[must_use]
pub(crate) fn toolkit_keys(toolkit: &ToolkitConfig, current: &Value) -> Vec<KeyPath> {
    let name = toolkit.runtime_name.as_str();
    let mut keys = Vec::new();
    if current
        .get("runtimes")
        .and_then(|runtimes| runtimes.get(name))
        .is_some()
    {
        keys.push(persist::key_path(&["runtimes", name]));
    }
    if current.get("default-runtime").and_then(Value::as_str) == Some(name) {
        keys.push(persist::key_path(&["default-runtime"]));
    }
    keys
}

fn remove_toolkit_settings_stage(toolkit: &ToolkitConfig, caps: &Capabilities) -> Stage {
    let runtime = caps.runtime.clone();
    let toolkit_for_action = toolkit.clone();
    let remove = action("daemon settings", move || {
        let runtime = runtime.clone();
        let toolkit = toolkit_for_action.clone();
        async move {
            let current = runtime.read_config().await?;
            let keys = toolkit_keys(&toolkit, &current);
            if !runtime.remove_config(&keys).await? {
                debug!("Daemon configuration already clean");
                return Ok(());
            }
            info!(keys = ?keys, "Removed accelerator runtime settings");
            if runtime.is_installed().await? {
                runtime.restart().await?;
            }
            Ok(())
        }
    });

    let runtime = caps.runtime.clone();
    let toolkit = toolkit.clone();
    Stage::new(REMOVE_TOOLKIT_SETTINGS, remove).with_probe(state_probe(
        REMOVE_TOOLKIT_SETTINGS,
        move || {
            let runtime = runtime.clone();
            let toolkit = toolkit.clone();
            async move {
                let current = runtime.read_config().await?;
                Ok(toolkit_keys(&toolkit, &current).is_empty())
            }
        },
    ))
}

fn source_removal_stage(name: &'static str, entry: SourceEntry, caps: &Capabilities) -> Stage {
    let packages = caps.packages.clone();
    let probe_packages = caps.packages.clone();
    let probe_entry = entry.clone();
    let label = entry.file.display().to_string();

    let remove: Arc<dyn Action> = action(label, move || {
        let packages = packages.clone();
        let entry = entry.clone();
        async move {
            if packages.remove_source(&entry).await? {
                info!(file = %entry.file.display(), id = %entry.id, "Removed source");
            }
            Ok(())
        }
    });

    Stage::new(name, remove).with_probe(state_probe(name, move || {
        let packages = probe_packages.clone();
        let entry = probe_entry.clone();
        async move {
            let key_present = entry.key.as_ref().is_some_and(|key| key.keyring.exists());
            Ok(!key_present && !packages.source_configured(&entry).await?)
        }
    }))
}

fn remove_toolkit_source_stage(toolkit: &ToolkitConfig, caps: &Capabilities) -> Stage {
    let key_url = toolkit
        .repo_mirrors
        .first()
        .map(|mirror| format!("{}/gpgkey", mirror.trim_end_matches('/')))
        .unwrap_or_default();
    let entry = SourceEntry::new(TOOLKIT_BLOCK, &toolkit.repo_list).with_key(key_url, &toolkit.keyring);
    source_removal_stage(REMOVE_TOOLKIT_SOURCE, entry, caps)
}

fn remove_mirror_source_stage(config: &NodeprepConfig, caps: &Capabilities) -> Stage {
    let entry = SourceEntry::new(MIRROR_BLOCK, &config.sources.file);
    source_removal_stage(REMOVE_MIRROR_SOURCE, entry, caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        MockAcceleratorProbe, MockClusterCli, MockContainerRuntime, MockHost, MockPackageManager,
    };
    use crate::core::StageOutcome;
    use crate::events::NoOpEventSink;
    use crate::persist::key_path;
    use crate::testing::{assert_all_skipped, assert_completed, assert_outcome};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn caps(
        packages: MockPackageManager,
        runtime: MockContainerRuntime,
        cluster: MockClusterCli,
    ) -> Capabilities {
        Capabilities {
            packages: Arc::new(packages),
            runtime: Arc::new(runtime),
            cluster: Arc::new(cluster),
            accelerator: Arc::new(MockAcceleratorProbe::new()),
            host: Arc::new(MockHost::new()),
        }
    }

    fn tempdir_config(dir: &std::path::Path) -> NodeprepConfig {
        let mut config = NodeprepConfig::default();
        config.sources.file = dir.join("mirror.list");
        config.toolkit.repo_list = dir.join("toolkit.list");
        config.toolkit.keyring = dir.join("toolkit.gpg");
        config.container_runtime.daemon_config = dir.join("daemon.json");
        config
    }

    #[test]
    fn test_toolkit_keys_only_touch_own_runtime() {
        let toolkit = ToolkitConfig::default();
        let current = json!({
            "default-runtime": "runc",
            "runtimes": {"nvidia": {"path": "nvidia-container-runtime"}, "crun": {}}
        });
        assert_eq!(toolkit_keys(&toolkit, &current), vec![key_path(&["runtimes", "nvidia"])]);

        let owned = json!({"default-runtime": "nvidia"});
        assert_eq!(toolkit_keys(&toolkit, &owned), vec![key_path(&["default-runtime"])]);
        assert!(toolkit_keys(&toolkit, &json!({})).is_empty());
    }

    #[test]
    fn test_toolkit_keys_keep_dotted_runtime_name() {
        let toolkit = ToolkitConfig {
            runtime_name: "nvidia.cdi".into(),
            ..ToolkitConfig::default()
        };
        let mut current = json!({
            "default-runtime": "nvidia.cdi",
            "runtimes": {"nvidia.cdi": {"path": "nvidia-container-runtime"}}
        });

        let keys = toolkit_keys(&toolkit, &current);
        assert_eq!(keys, vec![key_path(&["runtimes", "nvidia.cdi"]), key_path(&["default-runtime"])]);
        for key in &keys {
            assert!(persist::remove_json_path(&mut current, key));
        }
        assert_eq!(current, json!({"runtimes": {}}));
        assert!(toolkit_keys(&toolkit, &current).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_on_clean_host_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = tempdir_config(dir.path());

        let mut packages = MockPackageManager::new();
        packages.expect_source_configured().returning(|_| Ok(false));
        packages.expect_remove_source().never();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_read_config().returning(|| Ok(json!({})));
        runtime.expect_remove_config().never();
        let mut cluster = MockClusterCli::new();
        cluster.expect_is_installed().returning(|| Ok(false));
        cluster.expect_uninstall_runtime().never();

        let pipeline =
            cleanup_pipeline(&config, &caps(packages, runtime, cluster), Arc::new(NoOpEventSink))
                .unwrap();
        let result = pipeline.run().await;

        assert_completed(&result);
        assert_all_skipped(&result);
        assert_eq!(result.stages.len(), 6);
        assert!(!persist::has_block(&config.sources.file, MIRROR_BLOCK).unwrap());
        assert!(!config.toolkit.keyring.exists());
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_contained() {
        let dir = tempfile::tempdir().unwrap();
        let config = tempdir_config(dir.path());

        let mut packages = MockPackageManager::new();
        packages.expect_source_configured().returning(|_| Ok(true));
        packages.expect_remove_source().times(2).returning(|_| Ok(true));
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_read_config()
            .returning(|| Ok(json!({"runtimes": {"nvidia": {}}})));
        runtime
            .expect_remove_config()
            .withf(|keys| keys == [key_path(&["runtimes", "nvidia"])])
            .returning(|_| Ok(true));
        runtime.expect_is_installed().returning(|| Ok(false));
        runtime.expect_restart().never();
        let mut cluster = MockClusterCli::new();
        cluster.expect_is_installed().returning(|| Ok(true));
        cluster.expect_list_resources().returning(|_| {
            Ok(vec![crate::capabilities::ResourceSummary {
                name: "x".into(),
                namespace: None,
                phase: None,
            }])
        });
        cluster
            .expect_delete_resource()
            .returning(|_, _, _| Err(ActionError::command_failed("kubectl delete", Some(1), "forbidden")));
        cluster
            .expect_delete_manifest()
            .returning(|_| Err(ActionError::command_failed("kubectl delete", Some(1), "unreachable")));
        cluster
            .expect_uninstall_runtime()
            .times(1)
            .returning(|| Ok(()));

        let pipeline =
            cleanup_pipeline(&config, &caps(packages, runtime, cluster), Arc::new(NoOpEventSink))
                .unwrap();
        let result = pipeline.run().await;

        assert_completed(&result);
        assert_outcome(&result, REMOVE_VALIDATION_WORKLOAD, StageOutcome::FailedNonFatal);
        assert_outcome(&result, REMOVE_ACCELERATOR_PLUGIN, StageOutcome::FailedNonFatal);
        assert_outcome(&result, UNINSTALL_CLUSTER_RUNTIME, StageOutcome::Success);
        assert_outcome(&result, REMOVE_TOOLKIT_SETTINGS, StageOutcome::Success);
        assert_outcome(&result, REMOVE_TOOLKIT_SOURCE, StageOutcome::Success);
        assert_outcome(&result, REMOVE_MIRROR_SOURCE, StageOutcome::Success);
    }
}
