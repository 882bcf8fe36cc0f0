//! Device classification from runtime-queried properties.
//!
//! Native helper binaries are built per ABI and per SDK level, so the
//! pipeline derives a [`DeploymentClassifier`] from the device's properties at
//! the start of every run. Preview builds report the SDK level of the stable
//! release they precede plus a separate preview marker; the marker is folded
//! into the effective SDK so both builds select different artifacts.

use std::time::Duration;

use thiserror::Error;

use crate::transport::{Device, Properties, TransportError, bounded};

/// Property carrying the OS API level.
pub const SDK_PROPERTY: &str = "ro.build.version.sdk";
/// Property carrying the primary CPU ABI.
pub const ABI_PROPERTY: &str = "ro.product.cpu.abi";
/// Property carrying the preview SDK marker (`0` on stable builds).
pub const PREVIEW_SDK_PROPERTY: &str = "ro.build.version.preview_sdk";
/// Property carrying the product model, used for diagnostics only.
pub const MODEL_PROPERTY: &str = "ro.product.model";

/// Inputs used to select architecture-matched artifacts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentClassifier {
    /// CPU ABI, for example `arm64-v8a`.
    pub abi: String,
    /// SDK level with the preview marker appended when present.
    pub effective_sdk: String,
    /// Product model, when reported.
    pub model: Option<String>,
}

/// Errors raised while classifying a device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PropertyQueryError {
    /// Raised when the device cannot be queried.
    #[error("failed to query device properties: {0}")]
    Unreachable(#[from] TransportError),
    /// Raised when a property required for artifact selection is absent.
    #[error("device did not report {property}")]
    MissingProperty {
        /// Missing property key.
        property: String,
    },
}

/// Combines the reported SDK level with the preview marker.
///
/// The marker is appended only when it is present and not `"0"`.
///
/// # Examples
///
/// ```
/// use droidprov::classify::effective_sdk;
///
/// assert_eq!(effective_sdk("29", Some("0")), "29");
/// assert_eq!(effective_sdk("25", Some("1")), "251");
/// assert_eq!(effective_sdk("30", None), "30");
/// ```
#[must_use]
pub fn effective_sdk(sdk: &str, preview: Option<&str>) -> String {
    match preview {
        Some(marker) if !marker.is_empty() && marker != "0" => format!("{sdk}{marker}"),
        _ => sdk.to_owned(),
    }
}

/// Derives a classifier from an already fetched property mapping.
///
/// # Errors
///
/// Returns [`PropertyQueryError::MissingProperty`] when the SDK level or ABI
/// is absent or blank.
pub fn classify(properties: &Properties) -> Result<DeploymentClassifier, PropertyQueryError> {
    let sdk = required(properties, SDK_PROPERTY)?;
    let abi = required(properties, ABI_PROPERTY)?;
    let preview = properties.get(PREVIEW_SDK_PROPERTY).map(String::as_str);
    let model = properties
        .get(MODEL_PROPERTY)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());

    Ok(DeploymentClassifier {
        abi: abi.to_owned(),
        effective_sdk: effective_sdk(sdk, preview),
        model,
    })
}

fn required<'a>(properties: &'a Properties, key: &str) -> Result<&'a str, PropertyQueryError> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PropertyQueryError::MissingProperty {
            property: key.to_owned(),
        })
}

/// Queries devices and classifies them.
///
/// The resolver keeps no state between calls; a device may be re-imaged
/// between attach cycles, so every run queries afresh.
#[derive(Clone, Debug)]
pub struct PropertyResolver {
    operation_timeout: Duration,
}

impl PropertyResolver {
    /// Creates a resolver bounding the property query by `operation_timeout`.
    #[must_use]
    pub const fn new(operation_timeout: Duration) -> Self {
        Self { operation_timeout }
    }

    /// Fetches the device's properties and derives its classifier.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyQueryError::Unreachable`] when the query fails or
    /// times out, and [`PropertyQueryError::MissingProperty`] when required
    /// keys are absent.
    pub async fn resolve<D>(&self, device: &D) -> Result<DeploymentClassifier, PropertyQueryError>
    where
        D: Device + ?Sized,
    {
        let properties = bounded(self.operation_timeout, "getprop", device.properties()).await?;
        classify(&properties)
    }
}
