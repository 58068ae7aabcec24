//! The stage catalog for provisioning and tearing down an accelerator node.
//!
//! [`build_pipeline`] turns a [`Mode`], the configuration and a set of
//! [`Capabilities`] into a ready-to-run [`Pipeline`].

mod cleanup;
mod install;

pub use cleanup::cleanup_pipeline;
pub use install::{install_pipeline, toolkit_settings};

use crate::capabilities::Capabilities;
use crate::config::NodeprepConfig;
use crate::core::ProbeResult;
use crate::errors::{ActionError, NodeprepError};
use crate::events::EventSink;
use crate::pipeline::{MirrorChain, Pipeline};
use crate::stages::{Action, FnAction, FnProbe, Probe, Stage};
use std::future::Future;
use std::sync::Arc;

/// Stage names, shared by the catalogs, the tests and the docs.
pub mod names {
    /// Warns when not running as root.
    pub const CHECK_PRIVILEGES: &str = "check-privileges";
    /// Distribution package mirror.
    pub const CONFIGURE_SOURCES: &str = "configure-sources";
    /// Accelerator driver presence.
    pub const VERIFY_DRIVER: &str = "verify-driver";
    /// Swap off, now and at boot.
    pub const DISABLE_SWAP: &str = "disable-swap";
    /// Container runtime.
    pub const INSTALL_CONTAINER_RUNTIME: &str = "install-container-runtime";
    /// Accelerator container toolkit and daemon settings.
    pub const INSTALL_ACCELERATOR_TOOLKIT: &str = "install-accelerator-toolkit";
    /// Cluster runtime.
    pub const INSTALL_CLUSTER_RUNTIME: &str = "install-cluster-runtime";
    /// Client kubeconfig copy.
    pub const CONFIGURE_CLUSTER_CLIENT: &str = "configure-cluster-client";
    /// Accelerator device plugin.
    pub const INSTALL_ACCELERATOR_PLUGIN: &str = "install-accelerator-plugin";
    /// Validation workload.
    pub const VERIFY_END_TO_END: &str = "verify-end-to-end";

    /// Validation workload removal.
    pub const REMOVE_VALIDATION_WORKLOAD: &str = "remove-validation-workload";
    /// Device plugin removal.
    pub const REMOVE_ACCELERATOR_PLUGIN: &str = "remove-accelerator-plugin";
    /// Cluster runtime removal.
    pub const UNINSTALL_CLUSTER_RUNTIME: &str = "uninstall-cluster-runtime";
    /// Toolkit daemon settings removal.
    pub const REMOVE_TOOLKIT_SETTINGS: &str = "remove-toolkit-settings";
    /// Toolkit repository removal.
    pub const REMOVE_TOOLKIT_SOURCE: &str = "remove-toolkit-source";
    /// Mirror block removal.
    pub const REMOVE_MIRROR_SOURCE: &str = "remove-mirror-source";
}

/// Which pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The forward pipeline, optionally preceded by a privilege check.
    Install {
        /// Prepend the non-fatal privilege check.
        check_privileges: bool,
    },
    /// The best-effort teardown pipeline.
    Cleanup,
}

impl Mode {
    /// Behavior when no mode was requested.
    #[must_use]
    pub fn implicit() -> Self {
        Self::Install {
            check_privileges: true,
        }
    }
}

/// Builds the pipeline for `mode`.
///
/// # Errors
///
/// Returns an error if the configuration cannot produce a valid pipeline.
pub fn build_pipeline(
    mode: Mode,
    config: &NodeprepConfig,
    caps: &Capabilities,
    sink: Arc<dyn EventSink>,
) -> Result<Pipeline, NodeprepError> {
    match mode {
        Mode::Install { check_privileges } => install_pipeline(config, caps, check_privileges, sink),
        Mode::Cleanup => cleanup_pipeline(config, caps, sink),
    }
}

/// Wraps an async closure as an action.
pub(crate) fn action<F, Fut>(label: impl Into<String>, func: F) -> Arc<dyn Action>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    Arc::new(FnAction::new(label, func))
}

/// Wraps an async state check as a probe.
///
/// `Ok(true)` means the end state holds; an error makes the probe
/// indeterminate so the stage runs anyway.
pub(crate) fn state_probe<F, Fut>(name: impl Into<String>, check: F) -> Arc<dyn Probe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ActionError>> + Send + 'static,
{
    Arc::new(FnProbe::new(name, move || {
        let pending = check();
        async move {
            match pending.await {
                Ok(satisfied) => ProbeResult::from_bool(satisfied),
                Err(err) => ProbeResult::Indeterminate(err.to_string()),
            }
        }
    }))
}

/// Builds a stage whose primary is the first candidate and whose fallbacks
/// are the rest.
pub(crate) fn stage_from_chain(
    name: &str,
    chain: MirrorChain,
) -> Result<Stage, NodeprepError> {
    let (primary, fallbacks) = chain
        .split_first()
        .ok_or_else(|| NodeprepError::Config(format!("stage '{name}' has no sources")))?;
    Ok(Stage::new(name, primary).with_fallbacks(fallbacks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAction;

    #[test]
    fn test_stage_from_chain_splits_primary() {
        let chain = MirrorChain::new()
            .with(RecordingAction::succeeding("upstream").into_action())
            .with(RecordingAction::succeeding("mirror").into_action());
        let stage = stage_from_chain("install-cluster-runtime", chain).unwrap();
        assert_eq!(stage.primary().label(), "upstream");
        assert_eq!(stage.fallbacks().len(), 1);

        assert!(stage_from_chain("empty", MirrorChain::new()).is_err());
    }

    #[tokio::test]
    async fn test_state_probe_maps_errors_to_indeterminate() {
        let satisfied = state_probe("ok", || async { Ok(true) });
        assert_eq!(satisfied.check().await, ProbeResult::Satisfied);

        let failing = state_probe("err", || async {
            Err(ActionError::precondition("permission denied"))
        });
        assert_eq!(
            failing.check().await,
            ProbeResult::Indeterminate("permission denied".into())
        );
    }

    #[test]
    fn test_implicit_mode_checks_privileges() {
        assert_eq!(
            Mode::implicit(),
            Mode::Install {
                check_privileges: true
            }
        );
    }
}
