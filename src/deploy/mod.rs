//! Atomic file delivery to a device.
//!
//! Content is written to a sibling temp path (`<dest>.tmp-<suffix>`) and then
//! renamed onto the destination with the device's `mv`. The temp path shares
//! the destination's parent directory, so the rename never crosses a
//! filesystem. Observers of the destination see either the previous complete
//! file or the new one, and an executable that is currently running is
//! replaced instead of rewritten in place ("text file busy").

use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::transport::{Device, TransportError, bounded};

/// Marker inserted between the destination path and the temp suffix.
pub const TEMP_MARKER: &str = ".tmp-";

/// Errors raised while deploying a file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Raised when the local artifact cannot be read.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// Raised when writing the temp file fails.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Final destination path.
        path: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when renaming the temp file onto the destination fails.
    #[error("failed to move {temp_path} onto {path}: {source}")]
    Rename {
        /// Final destination path.
        path: String,
        /// Temp path that was written.
        temp_path: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
}

/// How temp file names are suffixed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum TempSuffix {
    /// A fresh random suffix per deployment.
    #[default]
    Random,
    /// The same suffix every time.
    Fixed(String),
}

/// Deploys files so the destination is never observed half-written.
#[derive(Clone, Debug)]
pub struct AtomicDeployer {
    operation_timeout: Duration,
    suffix: TempSuffix,
}

impl AtomicDeployer {
    /// Creates a deployer bounding each device operation by
    /// `operation_timeout`.
    #[must_use]
    pub const fn new(operation_timeout: Duration) -> Self {
        Self {
            operation_timeout,
            suffix: TempSuffix::Random,
        }
    }

    /// Uses `suffix` for every temp file instead of a random one.
    #[must_use]
    pub fn with_fixed_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = TempSuffix::Fixed(suffix.into());
        self
    }

    /// Returns a temp path next to `remote_path`.
    #[must_use]
    pub fn temp_path_for(&self, remote_path: &str) -> String {
        let suffix = match &self.suffix {
            TempSuffix::Random => Uuid::new_v4().simple().to_string(),
            TempSuffix::Fixed(value) => value.clone(),
        };
        format!("{remote_path}{TEMP_MARKER}{suffix}")
    }

    /// Reads `artifact` from `store` and deploys it to `remote_path`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Artifact`] when the local file cannot be read,
    /// otherwise any error from [`AtomicDeployer::deploy`].
    pub async fn deploy_artifact<D>(
        &self,
        device: &D,
        store: &ArtifactStore,
        artifact: &Utf8Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), DeployError>
    where
        D: Device + ?Sized,
    {
        let content = store.read(artifact)?;
        self.deploy(device, &content, remote_path, mode).await
    }

    /// Writes `content` to `remote_path` with permission `mode`.
    ///
    /// Re-running with identical inputs yields the same end state. When the
    /// write or rename fails the temp file is removed on a best-effort basis
    /// and the destination keeps its previous content.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Write`] or [`DeployError::Rename`] with the
    /// underlying transport error.
    pub async fn deploy<D>(
        &self,
        device: &D,
        content: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), DeployError>
    where
        D: Device + ?Sized,
    {
        let temp_path = self.temp_path_for(remote_path);
        debug!(
            serial = device.serial(),
            path = remote_path,
            mode = format_args!("{mode:o}"),
            "writing temp file"
        );

        let write = device.write_file(&temp_path, content, mode);
        if let Err(source) = bounded(self.operation_timeout, "write", write).await {
            self.discard(device, &temp_path).await;
            return Err(DeployError::Write {
                path: remote_path.to_owned(),
                source,
            });
        }

        let rename_args = [temp_path.clone(), remote_path.to_owned()];
        let rename = device.run_command("mv", &rename_args);
        if let Err(source) = bounded(self.operation_timeout, "mv", rename).await {
            self.discard(device, &temp_path).await;
            return Err(DeployError::Rename {
                path: remote_path.to_owned(),
                temp_path,
                source,
            });
        }

        Ok(())
    }

    async fn discard<D>(&self, device: &D, temp_path: &str)
    where
        D: Device + ?Sized,
    {
        let args = [String::from("-f"), temp_path.to_owned()];
        let cleanup = device.run_command("rm", &args);
        if let Err(err) = bounded(self.operation_timeout, "rm", cleanup).await {
            debug!(
                serial = device.serial(),
                path = temp_path,
                error = %err,
                "temp file cleanup failed"
            );
        }
    }
}
