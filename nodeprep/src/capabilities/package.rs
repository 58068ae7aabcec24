//! Package installation and package source configuration.

use super::command::{run_checked, CommandRunner, CommandSpec};
use super::fetch::Fetcher;
use crate::errors::ActionError;
use crate::persist;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A package to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Package name.
    pub name: String,
    /// Pinned version, if any.
    pub version: Option<String>,
}

impl PackageSpec {
    /// Creates an unpinned package spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}={version}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A signing key to install alongside a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    /// ASCII-armored key location.
    pub url: String,
    /// Where the dearmored keyring is written.
    pub keyring: PathBuf,
}

/// A package source managed as one block in a sources file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Block identifier, stable across mirrors.
    pub id: String,
    /// The sources file holding the block.
    pub file: PathBuf,
    /// Lines of the block.
    pub lines: Vec<String>,
    /// Optional signing key.
    pub key: Option<SigningKey>,
}

impl SourceEntry {
    /// Creates an entry without lines or key.
    #[must_use]
    pub fn new(id: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            file: file.into(),
            lines: Vec::new(),
            key: None,
        }
    }

    /// Appends a source line.
    #[must_use]
    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// Sets the signing key.
    #[must_use]
    pub fn with_key(mut self, url: impl Into<String>, keyring: impl Into<PathBuf>) -> Self {
        self.key = Some(SigningKey {
            url: url.into(),
            keyring: keyring.into(),
        });
        self
    }
}

/// The host package manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Returns true if `package` is installed.
    async fn is_installed(&self, package: &str) -> Result<bool, ActionError>;

    /// Installs a package.
    async fn install(&self, spec: &PackageSpec) -> Result<(), ActionError>;

    /// Removes a package and its configuration; absent packages are fine.
    async fn uninstall(&self, package: &str) -> Result<(), ActionError>;

    /// Returns true if the block for `entry` is present.
    async fn source_configured(&self, entry: &SourceEntry) -> Result<bool, ActionError>;

    /// Writes the source block, installs its key and refreshes the index.
    ///
    /// When the refresh fails the block is removed again before the error
    /// is returned, along with a keyring this call created.
    async fn configure_source(&self, entry: &SourceEntry) -> Result<(), ActionError>;

    /// Removes the source block and its key. Returns true if anything changed.
    async fn remove_source(&self, entry: &SourceEntry) -> Result<bool, ActionError>;
}

/// [`PackageManager`] for Debian-family hosts.
#[derive(Clone)]
pub struct AptPackageManager {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
}

impl AptPackageManager {
    /// Creates an apt-backed package manager.
    pub fn new(runner: Arc<dyn CommandRunner>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { runner, fetcher }
    }

    fn apt_get(args: &[&str]) -> CommandSpec {
        CommandSpec::new("apt-get")
            .args(args.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn install_key(&self, key: &SigningKey) -> Result<(), ActionError> {
        let armored = self.fetcher.fetch(&key.url).await?;
        if let Some(dir) = key.keyring.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let spec = CommandSpec::new("gpg")
            .args(["--batch", "--yes", "--dearmor", "-o"])
            .arg(key.keyring.to_string_lossy())
            .stdin(armored);
        run_checked(self.runner.as_ref(), &spec).await?;
        debug!(keyring = %key.keyring.display(), "Installed signing key");
        Ok(())
    }
}

impl fmt::Debug for AptPackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AptPackageManager").finish_non_exhaustive()
    }
}

#[async_trait]
impl PackageManager for AptPackageManager {
    async fn is_installed(&self, package: &str) -> Result<bool, ActionError> {
        let spec = CommandSpec::new("dpkg-query")
            .args(["-W", "-f=${Status}"])
            .arg(package);
        let output = self.runner.run(&spec).await?;
        Ok(output.success() && output.stdout.contains("install ok installed"))
    }

    async fn install(&self, spec: &PackageSpec) -> Result<(), ActionError> {
        info!(package = %spec, "Installing package");
        let command = Self::apt_get(&["install", "-y", "--no-install-recommends"])
            .arg(spec.to_string());
        run_checked(self.runner.as_ref(), &command).await?;
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<(), ActionError> {
        if !self.is_installed(package).await? {
            debug!(package, "Package not installed, nothing to remove");
            return Ok(());
        }
        info!(package, "Removing package");
        let command = Self::apt_get(&["purge", "-y"]).arg(package);
        run_checked(self.runner.as_ref(), &command).await?;
        Ok(())
    }

    async fn source_configured(&self, entry: &SourceEntry) -> Result<bool, ActionError> {
        Ok(persist::has_block(&entry.file, &entry.id)?)
    }

    async fn configure_source(&self, entry: &SourceEntry) -> Result<(), ActionError> {
        let mut new_keyring = None;
        if let Some(key) = &entry.key {
            let existed = key.keyring.exists();
            self.install_key(key).await?;
            if !existed {
                new_keyring = Some(&key.keyring);
            }
        }

        let changed = persist::ensure_block(&entry.file, &entry.id, &entry.lines)?;
        debug!(file = %entry.file.display(), id = %entry.id, changed, "Source block written");

        if let Err(err) = run_checked(self.runner.as_ref(), &Self::apt_get(&["update"])).await {
            if let Err(rollback) = persist::remove_block(&entry.file, &entry.id) {
                warn!(file = %entry.file.display(), error = %rollback, "Failed to roll back source block");
            }
            if let Some(keyring) = new_keyring {
                if let Err(rollback) = std::fs::remove_file(keyring) {
                    warn!(keyring = %keyring.display(), error = %rollback, "Failed to remove signing key");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn remove_source(&self, entry: &SourceEntry) -> Result<bool, ActionError> {
        let mut changed = persist::remove_block(&entry.file, &entry.id)?;
        if let Some(key) = &entry.key {
            match std::fs::remove_file(&key.keyring) {
                Ok(()) => changed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::command::{CommandOutput, MockCommandRunner};
    use crate::capabilities::fetch::MockFetcher;

    fn manager(runner: MockCommandRunner) -> AptPackageManager {
        AptPackageManager::new(Arc::new(runner), Arc::new(MockFetcher::new()))
    }

    #[tokio::test]
    async fn test_is_installed_parses_status() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "dpkg-query" && spec.args.last().map(String::as_str) == Some("docker.io"))
            .returning(|_| Ok(CommandOutput::ok("install ok installed")));
        runner
            .expect_run()
            .withf(|spec| spec.args.last().map(String::as_str) == Some("nvidia-container-toolkit"))
            .returning(|_| Ok(CommandOutput::failed(1, "no packages found")));

        let apt = manager(runner);
        assert!(apt.is_installed("docker.io").await.unwrap());
        assert!(!apt.is_installed("nvidia-container-toolkit").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_pins_version() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == "apt-get"
                    && spec.args.last().map(String::as_str) == Some("docker.io=24.0")
                    && spec.env.contains_key("DEBIAN_FRONTEND")
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));

        let spec = PackageSpec {
            name: "docker.io".into(),
            version: Some("24.0".into()),
        };
        manager(runner).install(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_source_rolls_back_on_update_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nodeprep.list");
        std::fs::write(&file, "deb http://upstream focal main\n").unwrap();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.has_args_prefix(&["update"]))
            .times(1)
            .returning(|_| Ok(CommandOutput::failed(100, "Could not resolve host")));

        let entry = SourceEntry::new("mirror", &file).with_line("deb http://bad focal main");
        let err = manager(runner).configure_source(&entry).await.unwrap_err();

        assert!(err.to_string().contains("Could not resolve host"));
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "deb http://upstream focal main\n"
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_removes_new_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nodeprep.list");
        let keyring = dir.path().join("keyrings/toolkit.gpg");

        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok(b"-----BEGIN PGP PUBLIC KEY BLOCK-----".to_vec()));

        let mut runner = MockCommandRunner::new();
        let written = keyring.clone();
        runner
            .expect_run()
            .withf(|spec| spec.program == "gpg")
            .times(1)
            .returning(move |_| {
                std::fs::write(&written, b"dearmored").unwrap();
                Ok(CommandOutput::ok(""))
            });
        runner
            .expect_run()
            .withf(|spec| spec.has_args_prefix(&["update"]))
            .times(1)
            .returning(|_| Ok(CommandOutput::failed(100, "Could not resolve host")));

        let apt = AptPackageManager::new(Arc::new(runner), Arc::new(fetcher));
        let entry = SourceEntry::new("toolkit", &file)
            .with_line("deb [signed-by=toolkit.gpg] https://bad/stable/deb/$(ARCH) /")
            .with_key("https://bad/gpgkey", &keyring);

        assert!(apt.configure_source(&entry).await.is_err());
        assert!(!keyring.exists());
        assert!(!persist::has_block(&file, "toolkit").unwrap());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_existing_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nodeprep.list");
        let keyring = dir.path().join("toolkit.gpg");
        std::fs::write(&keyring, b"previous").unwrap();

        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|_| Ok(b"armored".to_vec()));

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "gpg")
            .returning(|_| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .withf(|spec| spec.has_args_prefix(&["update"]))
            .returning(|_| Ok(CommandOutput::failed(100, "Could not resolve host")));

        let apt = AptPackageManager::new(Arc::new(runner), Arc::new(fetcher));
        let entry = SourceEntry::new("toolkit", &file)
            .with_line("deb https://bad/stable /")
            .with_key("https://bad/gpgkey", &keyring);

        assert!(apt.configure_source(&entry).await.is_err());
        assert!(keyring.exists());
    }

    #[tokio::test]
    async fn test_configure_and_remove_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nodeprep.list");

        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(CommandOutput::ok("")));
        let apt = manager(runner);

        let entry = SourceEntry::new("mirror", &file).with_line("deb http://a focal main");
        assert!(!apt.source_configured(&entry).await.unwrap());
        apt.configure_source(&entry).await.unwrap();
        assert!(apt.source_configured(&entry).await.unwrap());

        assert!(apt.remove_source(&entry).await.unwrap());
        assert!(!apt.remove_source(&entry).await.unwrap());
    }
}
