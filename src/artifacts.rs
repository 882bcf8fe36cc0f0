//! Read access to the local vendor directory.
//!
//! Helper binaries, companion packages, and the agent are shipped in a vendor
//! directory on the controlling host. The store opens that directory once and
//! resolves every artifact relative to it, so a crafted relative path cannot
//! escape the vendor tree.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while reading local artifacts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Raised when the vendor directory cannot be opened.
    #[error("failed to open vendor directory {path}: {message}")]
    OpenRoot {
        /// Vendor directory path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an artifact cannot be read.
    #[error("failed to read artifact {path}: {message}")]
    Read {
        /// Artifact path relative to the vendor directory.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Capability-scoped handle to the vendor directory.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: Dir,
}

impl ArtifactStore {
    /// Opens the vendor directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::OpenRoot`] when the directory is missing or
    /// unreadable.
    pub fn open(root: &Utf8Path) -> Result<Self, ArtifactError> {
        let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| {
            ArtifactError::OpenRoot {
                path: root.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        Ok(Self { dir })
    }

    /// Reads the artifact at `relative` into memory.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Read`] when the file is missing, unreadable,
    /// or outside the vendor directory.
    pub fn read(&self, relative: &Utf8Path) -> Result<Vec<u8>, ArtifactError> {
        self.dir.read(relative).map_err(|err| ArtifactError::Read {
            path: relative.to_path_buf(),
            message: err.to_string(),
        })
    }
}
