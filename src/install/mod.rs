//! Companion package installation.
//!
//! Packages already present on the device are left alone: reinstalling on
//! every attach would wipe their local state. Missing packages are pushed to
//! a scratch location with the atomic deployer and handed to `pm install`.
//! The package manager reports failures in its output rather than through its
//! exit status, so the output is checked by an [`InstallOracle`].

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::deploy::{AtomicDeployer, DeployError};
use crate::transport::{Device, TransportError, bounded};

/// Substring `pm install` prints on success.
pub const INSTALL_SUCCESS_MARKER: &str = "Success";

const PACKAGE_MODE: u32 = 0o644;

/// Decides whether package manager output signals success.
pub trait InstallOracle: Send + Sync + std::fmt::Debug {
    /// Returns `true` when `output` reports a successful install.
    fn accepts(&self, output: &str) -> bool;
}

/// Oracle accepting output that contains a fixed marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuccessMarker {
    marker: String,
}

impl SuccessMarker {
    /// Creates an oracle looking for `marker`.
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for SuccessMarker {
    fn default() -> Self {
        Self::new(INSTALL_SUCCESS_MARKER)
    }
}

impl InstallOracle for SuccessMarker {
    fn accepts(&self, output: &str) -> bool {
        output.contains(self.marker.as_str())
    }
}

/// A package that must be present on the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompanionPackage {
    /// Package identifier, for example `com.github.uiautomator`.
    pub package_id: String,
    /// Package file relative to the vendor directory.
    pub artifact: Utf8PathBuf,
}

impl CompanionPackage {
    /// Creates a package description.
    #[must_use]
    pub fn new(package_id: impl Into<String>, artifact: impl Into<Utf8PathBuf>) -> Self {
        Self {
            package_id: package_id.into(),
            artifact: artifact.into(),
        }
    }
}

/// Errors raised while installing a package.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstallError {
    /// Raised when the package file has no usable file name.
    #[error("package artifact {path} has no file name")]
    InvalidArtifact {
        /// Offending artifact path.
        path: Utf8PathBuf,
    },
    /// Raised when pushing the package file fails.
    #[error("failed to push {package_id}: {source}")]
    Deploy {
        /// Package being installed.
        package_id: String,
        /// Underlying deploy error.
        #[source]
        source: DeployError,
    },
    /// Raised when the install command cannot be run.
    #[error("failed to run installer for {package_id}: {source}")]
    Command {
        /// Package being installed.
        package_id: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when the package manager does not report success.
    #[error("apk-install: {output}")]
    Rejected {
        /// Package being installed.
        package_id: String,
        /// Output printed by the package manager.
        output: String,
    },
}

/// Ensures companion packages are present on a device.
#[derive(Clone, Debug)]
pub struct PackageInstaller {
    deployer: AtomicDeployer,
    scratch_dir: String,
    oracle: Arc<dyn InstallOracle>,
    operation_timeout: Duration,
}

impl PackageInstaller {
    /// Creates an installer that stages package files in `scratch_dir`.
    #[must_use]
    pub fn new(scratch_dir: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            deployer: AtomicDeployer::new(operation_timeout),
            scratch_dir: scratch_dir.into(),
            oracle: Arc::new(SuccessMarker::default()),
            operation_timeout,
        }
    }

    /// Replaces the success oracle.
    #[must_use]
    pub fn with_oracle(mut self, oracle: impl InstallOracle + 'static) -> Self {
        self.oracle = Arc::new(oracle);
        self
    }

    /// Installs `package` unless it is already present.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError`] when staging, running, or validating the
    /// install fails.
    pub async fn ensure_installed<D>(
        &self,
        device: &D,
        store: &ArtifactStore,
        package: &CompanionPackage,
    ) -> Result<(), InstallError>
    where
        D: Device + ?Sized,
    {
        self.ensure_installed_together(device, store, std::slice::from_ref(package))
            .await
    }

    /// Installs every package in `packages` unless all are already present.
    ///
    /// Related packages are kept in step: when any one is missing the whole
    /// set is installed, each exactly once and in order, stopping at the
    /// first failure. Installed versions are not compared.
    ///
    /// # Errors
    ///
    /// Returns the first [`InstallError`] encountered.
    pub async fn ensure_installed_together<D>(
        &self,
        device: &D,
        store: &ArtifactStore,
        packages: &[CompanionPackage],
    ) -> Result<(), InstallError>
    where
        D: Device + ?Sized,
    {
        if self.all_present(device, packages).await {
            info!(
                serial = device.serial(),
                "companion packages already installed, skipping; uninstall them manually to force a reinstall"
            );
            return Ok(());
        }

        for package in packages {
            self.install(device, store, package).await?;
        }
        Ok(())
    }

    async fn all_present<D>(&self, device: &D, packages: &[CompanionPackage]) -> bool
    where
        D: Device + ?Sized,
    {
        for package in packages {
            let stat = device.stat_package(&package.package_id);
            match bounded(self.operation_timeout, "stat package", stat).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    debug!(
                        serial = device.serial(),
                        package = package.package_id.as_str(),
                        error = %err,
                        "package query failed, treating package as absent"
                    );
                    return false;
                }
            }
        }
        true
    }

    async fn install<D>(
        &self,
        device: &D,
        store: &ArtifactStore,
        package: &CompanionPackage,
    ) -> Result<(), InstallError>
    where
        D: Device + ?Sized,
    {
        let scratch = self.scratch_path(&package.artifact)?;
        info!(
            serial = device.serial(),
            package = package.package_id.as_str(),
            "installing companion package"
        );

        self.deployer
            .deploy_artifact(device, store, &package.artifact, &scratch, PACKAGE_MODE)
            .await
            .map_err(|source| InstallError::Deploy {
                package_id: package.package_id.clone(),
                source,
            })?;

        let args = [
            String::from("install"),
            String::from("-r"),
            String::from("-t"),
            scratch.clone(),
        ];
        let outcome = bounded(
            self.operation_timeout,
            "pm install",
            device.run_command("pm", &args),
        )
        .await;
        self.remove_scratch(device, &scratch).await;

        let output = outcome.map_err(|source| InstallError::Command {
            package_id: package.package_id.clone(),
            source,
        })?;
        if self.oracle.accepts(&output) {
            return Ok(());
        }
        Err(InstallError::Rejected {
            package_id: package.package_id.clone(),
            output: output.trim().to_owned(),
        })
    }

    fn scratch_path(&self, artifact: &Utf8Path) -> Result<String, InstallError> {
        let name = artifact
            .file_name()
            .ok_or_else(|| InstallError::InvalidArtifact {
                path: artifact.to_path_buf(),
            })?;
        Ok(format!("{}/{name}", self.scratch_dir.trim_end_matches('/')))
    }

    async fn remove_scratch<D>(&self, device: &D, scratch: &str)
    where
        D: Device + ?Sized,
    {
        let args = [scratch.to_owned()];
        let cleanup = device.run_command("rm", &args);
        if let Err(err) = bounded(self.operation_timeout, "rm", cleanup).await {
            debug!(
                serial = device.serial(),
                path = scratch,
                error = %err,
                "scratch package cleanup failed"
            );
        }
    }
}
