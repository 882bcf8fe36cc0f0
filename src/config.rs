//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::DEFAULT_REMOTE_TMP_DIR;

/// Default upper bound for a single device operation, in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;

/// Provisioning settings merged from defaults, configuration files,
/// environment variables, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DROIDPROV",
    discovery(
        app_name = "droidprov",
        env_var = "DROIDPROV_CONFIG_PATH",
        config_file_name = "droidprov.toml",
        dotfile_name = ".droidprov.toml",
        project_file_name = "droidprov.toml"
    )
)]
pub struct ProvisionConfig {
    /// Path to the `adb` executable.
    #[ortho_config(default = "adb".to_owned())]
    pub adb_bin: String,
    /// Local directory holding the binaries and packages to deploy.
    #[ortho_config(default = "vendor".to_owned())]
    pub vendor_dir: String,
    /// Server the agent registers with (`host:port`). Blank values are
    /// treated as unset.
    pub server_addr: Option<String>,
    /// Device directory that receives binaries and scratch packages.
    #[ortho_config(default = DEFAULT_REMOTE_TMP_DIR.to_owned())]
    pub remote_tmp_dir: String,
    /// Upper bound for each device operation, in seconds.
    #[ortho_config(default = DEFAULT_OPERATION_TIMEOUT_SECS)]
    pub operation_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to droidprov.toml",
            self.env_var, self.toml_key
        )
    }
}

const ADB_BIN: FieldMetadata = FieldMetadata::new("adb executable", "DROIDPROV_ADB_BIN", "adb_bin");
const VENDOR_DIR: FieldMetadata =
    FieldMetadata::new("vendor directory", "DROIDPROV_VENDOR_DIR", "vendor_dir");
const REMOTE_TMP_DIR: FieldMetadata = FieldMetadata::new(
    "device scratch directory",
    "DROIDPROV_REMOTE_TMP_DIR",
    "remote_tmp_dir",
);
const OPERATION_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "operation timeout",
    "DROIDPROV_OPERATION_TIMEOUT_SECS",
    "operation_timeout_secs",
);

impl ProvisionConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("droidprov")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the agent server address, ignoring blank values.
    #[must_use]
    pub fn server_addr(&self) -> Option<&str> {
        self.server_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }

    /// Returns the configured vendor directory.
    #[must_use]
    pub fn vendor_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.vendor_dir)
    }

    /// Returns the per-operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide values via environment variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.adb_bin, &ADB_BIN)?;
        Self::require_field(&self.vendor_dir, &VENDOR_DIR)?;
        Self::require_field(&self.remote_tmp_dir, &REMOTE_TMP_DIR)?;
        if !self.remote_tmp_dir.trim_start().starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "{} must be an absolute device path, got {:?}: {}",
                REMOTE_TMP_DIR.description,
                self.remote_tmp_dir,
                REMOTE_TMP_DIR.hint()
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be at least one second: {}",
                OPERATION_TIMEOUT.description,
                OPERATION_TIMEOUT.hint()
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
