//! Where artifacts live locally and where they land on the device.

use camino::Utf8PathBuf;

use crate::install::CompanionPackage;

/// Default scratch directory on the device.
pub const DEFAULT_REMOTE_TMP_DIR: &str = "/data/local/tmp";
/// Package identifier of the instrumentation host package.
pub const MAIN_PACKAGE_ID: &str = "com.github.uiautomator";
/// Package identifier of the instrumentation test package.
pub const TEST_PACKAGE_ID: &str = "com.github.uiautomator.test";
/// Service component started once a device is ready.
pub const COMPANION_SERVICE: &str = "com.github.uiautomator/.Service";

const STF_MODULES_DIR: &str = "stf-binaries-master/node_modules";
const EXECUTABLE_MODE: u32 = 0o755;
const LIBRARY_MODE: u32 = 0o644;

/// A vendor file and its destination on the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteArtifact {
    /// Path relative to the vendor directory.
    pub artifact: Utf8PathBuf,
    /// Absolute destination path on the device.
    pub remote_path: String,
    /// Permission mode applied on the device.
    pub mode: u32,
}

/// Maps a device classification onto vendor artifacts and remote paths.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactLayout {
    remote_tmp_dir: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_TMP_DIR)
    }
}

impl ArtifactLayout {
    /// Creates a layout that deploys into `remote_tmp_dir`.
    #[must_use]
    pub fn new(remote_tmp_dir: impl Into<String>) -> Self {
        let dir: String = remote_tmp_dir.into();
        let trimmed = dir.trim_end_matches('/');
        Self {
            remote_tmp_dir: if trimmed.is_empty() {
                String::from("/")
            } else {
                trimmed.to_owned()
            },
        }
    }

    /// Device directory binaries are deployed into.
    #[must_use]
    pub fn remote_tmp_dir(&self) -> &str {
        &self.remote_tmp_dir
    }

    /// Screen capture and input binaries matching `abi` and `effective_sdk`.
    #[must_use]
    pub fn native_binaries(&self, abi: &str, effective_sdk: &str) -> Vec<RemoteArtifact> {
        let minicap = format!("{STF_MODULES_DIR}/minicap-prebuilt/prebuilt/{abi}");
        let minitouch = format!("{STF_MODULES_DIR}/minitouch-prebuilt/prebuilt/{abi}");
        vec![
            self.remote(
                format!("{minicap}/lib/android-{effective_sdk}/minicap.so"),
                "minicap.so",
                LIBRARY_MODE,
            ),
            self.remote(format!("{minicap}/bin/minicap"), "minicap", EXECUTABLE_MODE),
            self.remote(
                format!("{minitouch}/bin/minitouch"),
                "minitouch",
                EXECUTABLE_MODE,
            ),
        ]
    }

    /// Companion packages, host package first.
    #[must_use]
    pub fn companion_packages(&self) -> Vec<CompanionPackage> {
        vec![
            CompanionPackage::new(MAIN_PACKAGE_ID, "app-uiautomator.apk"),
            CompanionPackage::new(TEST_PACKAGE_ID, "app-uiautomator-test.apk"),
        ]
    }

    /// The automation agent binary.
    #[must_use]
    pub fn agent(&self) -> RemoteArtifact {
        self.remote(String::from("atx-agent"), "atx-agent", EXECUTABLE_MODE)
    }

    fn remote(&self, artifact: String, file_name: &str, mode: u32) -> RemoteArtifact {
        let remote_path = if self.remote_tmp_dir == "/" {
            format!("/{file_name}")
        } else {
            format!("{}/{file_name}", self.remote_tmp_dir)
        };
        RemoteArtifact {
            artifact: Utf8PathBuf::from(artifact),
            remote_path,
            mode,
        }
    }
}
