//! Host-level facts and settings.

use super::command::{run_checked, CommandRunner, CommandSpec};
use crate::errors::ActionError;
use crate::persist;
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Prefix put in front of fstab lines this tool disables.
pub const FSTAB_COMMENT: &str = "# nodeprep: ";

/// The machine being provisioned.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Host: Send + Sync {
    /// Returns true when running with root privileges.
    async fn is_privileged(&self) -> Result<bool, ActionError>;

    /// Returns true if swap is active now or enabled at boot.
    async fn swap_active(&self) -> Result<bool, ActionError>;

    /// Turns swap off and disables it at boot.
    async fn disable_swap(&self) -> Result<(), ActionError>;

    /// Returns the distribution release codename, e.g. `jammy`.
    async fn os_codename(&self) -> Result<String, ActionError>;

    /// Returns the node's host name.
    async fn hostname(&self) -> Result<String, ActionError>;
}

/// Where [`SystemHost`] reads and writes host state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Filesystem table.
    pub fstab: PathBuf,
    /// Kernel swap table.
    pub swaps: PathBuf,
    /// Distribution release information.
    pub os_release: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            fstab: PathBuf::from("/etc/fstab"),
            swaps: PathBuf::from("/proc/swaps"),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }
}

fn codename_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?m)^(?:VERSION_CODENAME|UBUNTU_CODENAME)=["']?([A-Za-z0-9._-]+)["']?\s*$"#)
                .ok()
        })
        .as_ref()
}

/// Extracts the release codename from `/etc/os-release` content.
#[must_use]
pub fn parse_codename(os_release: &str) -> Option<String> {
    codename_pattern()?
        .captures(os_release)
        .map(|c| c[1].to_string())
}

/// Returns true if an fstab line mounts a swap device.
#[must_use]
pub fn is_swap_entry(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return false;
    }
    trimmed.split_whitespace().nth(2) == Some("swap")
}

/// Comments out every active swap entry. Returns the new content, or `None`
/// when nothing needed changing.
#[must_use]
pub fn comment_swap_entries(fstab: &str) -> Option<String> {
    if !fstab.lines().any(is_swap_entry) {
        return None;
    }
    let mut out: String = fstab
        .lines()
        .map(|line| {
            if is_swap_entry(line) {
                format!("{FSTAB_COMMENT}{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    Some(out)
}

/// Returns true if the kernel swap table lists any device.
#[must_use]
pub fn swaps_listed(swaps: &str) -> bool {
    swaps.lines().skip(1).any(|line| !line.trim().is_empty())
}

/// [`Host`] for the local Linux machine.
#[derive(Clone)]
pub struct SystemHost {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
}

impl SystemHost {
    /// Creates a host handle.
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths) -> Self {
        Self { runner, paths }
    }
}

impl fmt::Debug for SystemHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemHost")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn is_privileged(&self) -> Result<bool, ActionError> {
        let uid = run_checked(self.runner.as_ref(), &CommandSpec::new("id").arg("-u")).await?;
        Ok(uid.trim() == "0")
    }

    async fn swap_active(&self) -> Result<bool, ActionError> {
        let swaps = persist::read_or_empty(&self.paths.swaps)?;
        let fstab = persist::read_or_empty(&self.paths.fstab)?;
        Ok(swaps_listed(&swaps) || fstab.lines().any(is_swap_entry))
    }

    async fn disable_swap(&self) -> Result<(), ActionError> {
        let swaps = persist::read_or_empty(&self.paths.swaps)?;
        if swaps_listed(&swaps) {
            info!("Turning swap off");
            run_checked(self.runner.as_ref(), &CommandSpec::new("swapoff").arg("-a")).await?;
        }

        let fstab = persist::read_or_empty(&self.paths.fstab)?;
        if let Some(updated) = comment_swap_entries(&fstab) {
            persist::write_if_changed(&self.paths.fstab, updated.as_bytes())?;
            info!(path = %self.paths.fstab.display(), "Disabled swap entries");
        } else {
            debug!("No swap entries in fstab");
        }
        Ok(())
    }

    async fn os_codename(&self) -> Result<String, ActionError> {
        let content = persist::read_or_empty(&self.paths.os_release)?;
        parse_codename(&content).ok_or_else(|| {
            ActionError::parse(
                self.paths.os_release.display().to_string(),
                "no VERSION_CODENAME entry",
            )
        })
    }

    async fn hostname(&self) -> Result<String, ActionError> {
        let name = run_checked(self.runner.as_ref(), &CommandSpec::new("hostname")).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ActionError::parse("hostname", "empty output"));
        }
        Ok(name.to_string())
    }
}
