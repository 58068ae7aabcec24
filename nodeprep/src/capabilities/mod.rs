//! Narrow interfaces to the external systems a node is provisioned with.
//!
//! Stages never shell out directly. They go through the traits here, each
//! with one command-line backed implementation:
//! - [`PackageManager`] / [`AptPackageManager`]
//! - [`ContainerRuntime`] / [`DockerDaemon`]
//! - [`ClusterCli`] / [`K3sCluster`]
//! - [`AcceleratorProbe`] / [`NvidiaSmiProbe`]
//! - [`Host`] / [`SystemHost`]
//!
//! All of them sit on a [`CommandRunner`] and a [`Fetcher`], which tests
//! replace with mocks or scripted fakes.

mod accelerator;
mod cluster;
mod command;
mod fetch;
mod host;
mod package;
mod runtime;
mod script;

pub use accelerator::{parse_device_csv, AcceleratorDevice, AcceleratorProbe, NvidiaSmiProbe};
pub use cluster::{
    parse_resource_list, ClusterCli, K3sCluster, ManifestSource, ResourceFilter, ResourceSummary,
};
pub use command::{
    run_checked, CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner, EXIT_NOT_FOUND,
};
pub use fetch::{Fetcher, HttpFetcher};
pub use host::{Host, HostPaths, SystemHost, FSTAB_COMMENT};
pub use package::{AptPackageManager, PackageManager, PackageSpec, SigningKey, SourceEntry};
pub use runtime::{ContainerRuntime, DockerDaemon, RuntimeInfo};
pub use script::{run_script, ScriptSource};

#[cfg(test)]
pub use accelerator::MockAcceleratorProbe;
#[cfg(test)]
pub use cluster::MockClusterCli;
#[cfg(test)]
pub use command::MockCommandRunner;
#[cfg(test)]
pub use fetch::MockFetcher;
#[cfg(test)]
pub use host::MockHost;
#[cfg(test)]
pub use package::MockPackageManager;
#[cfg(test)]
pub use runtime::MockContainerRuntime;

use crate::config::NodeprepConfig;
use crate::errors::ActionError;
use std::fmt;
use std::sync::Arc;

/// The full set of capabilities the stage catalog needs.
#[derive(Clone)]
pub struct Capabilities {
    /// Package manager.
    pub packages: Arc<dyn PackageManager>,
    /// Container runtime daemon.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Cluster runtime and CLI.
    pub cluster: Arc<dyn ClusterCli>,
    /// Accelerator probe.
    pub accelerator: Arc<dyn AcceleratorProbe>,
    /// Host facts.
    pub host: Arc<dyn Host>,
}

impl Capabilities {
    /// Builds the command-backed implementations over `runner` and `fetcher`.
    pub fn with_backends(
        config: &NodeprepConfig,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            packages: Arc::new(AptPackageManager::new(runner.clone(), fetcher.clone())),
            runtime: Arc::new(DockerDaemon::new(
                runner.clone(),
                fetcher.clone(),
                &config.container_runtime.daemon_config,
            )),
            cluster: Arc::new(K3sCluster::new(
                runner.clone(),
                fetcher,
                &config.cluster.kubeconfig_source,
                &config.cluster.uninstall_script,
            )),
            accelerator: Arc::new(NvidiaSmiProbe::new(runner.clone())),
            host: Arc::new(SystemHost::new(runner, config.host.paths())),
        }
    }

    /// Builds the implementations that act on the local machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn system(config: &NodeprepConfig) -> Result<Self, ActionError> {
        Ok(Self::with_backends(
            config,
            Arc::new(SystemCommandRunner),
            Arc::new(HttpFetcher::new()?),
        ))
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
