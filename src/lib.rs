//! Core library for the droidprov device provisioning tool.
//!
//! Attached Android devices are detected through a device-control transport
//! and provisioned with the automation agent, its native helper binaries,
//! and the companion instrumentation packages. Each attach starts an
//! idempotent pipeline run; detaches discard in-flight results.

pub mod adb;
pub mod artifacts;
pub mod classify;
pub mod config;
pub mod deploy;
pub mod install;
pub mod orchestrator;
pub mod pipeline;
pub mod test_support;
pub mod transport;

pub use adb::{AdbDevice, AdbTransport, CommandRunner, ProcessCommandRunner};
pub use artifacts::{ArtifactError, ArtifactStore};
pub use classify::{DeploymentClassifier, PropertyQueryError, PropertyResolver};
pub use config::{ConfigError, ProvisionConfig};
pub use deploy::{AtomicDeployer, DeployError};
pub use install::{CompanionPackage, InstallError, InstallOracle, PackageInstaller, SuccessMarker};
pub use orchestrator::{
    DeviceState, Orchestrator, OrchestratorError, OrchestratorSummary, StateChange,
};
pub use pipeline::{
    ArtifactLayout, PipelineSettings, ProvisionReport, ProvisioningPipeline, ProvisioningResult,
    ProvisioningStep, StepError, StepFailure,
};
pub use transport::{
    Device, DeviceEvent, DeviceSummary, EventStream, Transport, TransportError, WatcherError,
    bounded,
};
