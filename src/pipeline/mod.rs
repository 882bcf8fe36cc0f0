//! The ordered provisioning sequence run against a single device.
//!
//! A run resolves the device classifier once and then works through the
//! deployment steps in a fixed order. The first failing step aborts the run
//! and is named in the result; nothing is retried. Starting the companion
//! service is deliberately not part of a run: the orchestrator issues it via
//! [`ProvisioningPipeline::activate`] only after accepting the run's result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::classify::{DeploymentClassifier, PropertyQueryError, PropertyResolver};
use crate::config::ProvisionConfig;
use crate::deploy::{AtomicDeployer, DeployError};
use crate::install::{InstallError, InstallOracle, PackageInstaller};
use crate::transport::{Device, TransportError, bounded};

mod layout;

pub use layout::{
    ArtifactLayout, COMPANION_SERVICE, DEFAULT_REMOTE_TMP_DIR, MAIN_PACKAGE_ID, RemoteArtifact,
    TEST_PACKAGE_ID,
};

/// A named stage of a provisioning run, in execution order.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProvisioningStep {
    /// Property query and classification.
    Properties,
    /// Screen capture and input helper binaries.
    NativeBinaries,
    /// Instrumentation package pair.
    CompanionPackages,
    /// Agent executable.
    AgentBinary,
    /// Agent daemon launch.
    AgentLaunch,
}

impl ProvisioningStep {
    /// Every step, in execution order.
    #[cfg(test)]
    pub const ALL: [Self; 5] = [
        Self::Properties,
        Self::NativeBinaries,
        Self::CompanionPackages,
        Self::AgentBinary,
        Self::AgentLaunch,
    ];

    /// Name used to attribute failures.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::NativeBinaries => "mini(cap|touch)",
            Self::CompanionPackages => "app-uiautomator[-test].apk",
            Self::AgentBinary => "atx-agent",
            Self::AgentLaunch => "start atx-agent",
        }
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Underlying cause of a failed step.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepError {
    /// Classification failed.
    #[error(transparent)]
    Properties(#[from] PropertyQueryError),
    /// A file could not be deployed.
    #[error(transparent)]
    Deploy(#[from] DeployError),
    /// A companion package could not be installed.
    #[error(transparent)]
    Install(#[from] InstallError),
    /// The agent could not be launched.
    #[error(transparent)]
    Launch(#[from] TransportError),
}

/// A failed step together with its cause.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{step}: {cause}")]
pub struct StepFailure {
    /// Step that failed.
    pub step: ProvisioningStep,
    /// Why it failed.
    #[source]
    pub cause: StepError,
}

impl StepFailure {
    fn new(step: ProvisioningStep, cause: impl Into<StepError>) -> Self {
        Self {
            step,
            cause: cause.into(),
        }
    }
}

/// Details of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionReport {
    /// Classifier the artifacts were selected with.
    pub classifier: DeploymentClassifier,
    /// Trimmed output of the agent launch, kept for diagnostics.
    pub agent_output: String,
}

/// Outcome of one provisioning run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisioningResult {
    /// Every step completed.
    Success(ProvisionReport),
    /// A step failed and the remaining steps were skipped.
    Failed(StepFailure),
}

impl ProvisioningResult {
    /// Returns `true` for [`ProvisioningResult::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Tunables for a [`ProvisioningPipeline`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PipelineSettings {
    /// Device directory binaries and scratch packages are written to.
    pub remote_tmp_dir: String,
    /// Server the agent registers with, if any.
    pub server_addr: Option<String>,
    /// Upper bound for each device operation.
    pub operation_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            remote_tmp_dir: String::from(DEFAULT_REMOTE_TMP_DIR),
            server_addr: None,
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ProvisionConfig> for PipelineSettings {
    fn from(config: &ProvisionConfig) -> Self {
        Self {
            remote_tmp_dir: config.remote_tmp_dir.clone(),
            server_addr: config.server_addr().map(str::to_owned),
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Runs the provisioning steps against a device.
///
/// Cloning is cheap; the artifact store is shared.
#[derive(Clone, Debug)]
pub struct ProvisioningPipeline {
    store: Arc<ArtifactStore>,
    layout: ArtifactLayout,
    resolver: PropertyResolver,
    deployer: AtomicDeployer,
    installer: PackageInstaller,
    server_addr: Option<String>,
    operation_timeout: Duration,
}

impl ProvisioningPipeline {
    /// Creates a pipeline reading artifacts from `store`.
    #[must_use]
    pub fn new(store: ArtifactStore, settings: PipelineSettings) -> Self {
        let layout = ArtifactLayout::new(settings.remote_tmp_dir);
        let timeout = settings.operation_timeout;
        Self {
            store: Arc::new(store),
            installer: PackageInstaller::new(layout.remote_tmp_dir(), timeout),
            layout,
            resolver: PropertyResolver::new(timeout),
            deployer: AtomicDeployer::new(timeout),
            server_addr: settings
                .server_addr
                .filter(|addr| !addr.trim().is_empty()),
            operation_timeout: timeout,
        }
    }

    /// Creates a pipeline configured from `config`.
    #[must_use]
    pub fn from_config(store: ArtifactStore, config: &ProvisionConfig) -> Self {
        Self::new(store, PipelineSettings::from(config))
    }

    /// Replaces the oracle that judges package manager output.
    #[must_use]
    pub fn with_install_oracle(mut self, oracle: impl InstallOracle + 'static) -> Self {
        self.installer = self.installer.with_oracle(oracle);
        self
    }

    /// Arguments passed to the agent on launch.
    #[must_use]
    pub fn agent_launch_args(&self) -> Vec<String> {
        let mut args = vec![String::from("-d")];
        if let Some(addr) = &self.server_addr {
            args.push(String::from("-t"));
            args.push(addr.clone());
        }
        args
    }

    /// Provisions `device`, stopping at the first failing step.
    pub async fn run<D>(&self, device: &D) -> ProvisioningResult
    where
        D: Device + ?Sized,
    {
        match self.try_run(device).await {
            Ok(report) => {
                info!(
                    serial = device.serial(),
                    agent_output = report.agent_output.as_str(),
                    "provisioning finished"
                );
                ProvisioningResult::Success(report)
            }
            Err(failure) => {
                warn!(
                    serial = device.serial(),
                    step = failure.step.name(),
                    cause = %failure.cause,
                    "provisioning failed"
                );
                ProvisioningResult::Failed(failure)
            }
        }
    }

    async fn try_run<D>(&self, device: &D) -> Result<ProvisionReport, StepFailure>
    where
        D: Device + ?Sized,
    {
        let serial = device.serial();

        debug!(serial, step = ProvisioningStep::Properties.name(), "step started");
        let classifier = self
            .resolver
            .resolve(device)
            .await
            .map_err(|err| StepFailure::new(ProvisioningStep::Properties, err))?;
        info!(
            serial,
            abi = classifier.abi.as_str(),
            sdk = classifier.effective_sdk.as_str(),
            model = classifier.model.as_deref().unwrap_or("unknown"),
            "device classified"
        );

        debug!(serial, step = ProvisioningStep::NativeBinaries.name(), "step started");
        let binaries = self
            .layout
            .native_binaries(&classifier.abi, &classifier.effective_sdk);
        self.deploy_all(device, &binaries)
            .await
            .map_err(|err| StepFailure::new(ProvisioningStep::NativeBinaries, err))?;

        debug!(serial, step = ProvisioningStep::CompanionPackages.name(), "step started");
        let packages = self.layout.companion_packages();
        self.installer
            .ensure_installed_together(device, &self.store, &packages)
            .await
            .map_err(|err| StepFailure::new(ProvisioningStep::CompanionPackages, err))?;

        debug!(serial, step = ProvisioningStep::AgentBinary.name(), "step started");
        let agent = self.layout.agent();
        self.deploy_all(device, std::slice::from_ref(&agent))
            .await
            .map_err(|err| StepFailure::new(ProvisioningStep::AgentBinary, err))?;

        debug!(serial, step = ProvisioningStep::AgentLaunch.name(), "step started");
        let args = self.agent_launch_args();
        let output = bounded(
            self.operation_timeout,
            "start atx-agent",
            device.run_command(&agent.remote_path, &args),
        )
        .await
        .map_err(|err| StepFailure::new(ProvisioningStep::AgentLaunch, err))?;

        Ok(ProvisionReport {
            classifier,
            agent_output: output.trim().to_owned(),
        })
    }

    async fn deploy_all<D>(&self, device: &D, artifacts: &[RemoteArtifact]) -> Result<(), DeployError>
    where
        D: Device + ?Sized,
    {
        for entry in artifacts {
            debug!(
                serial = device.serial(),
                artifact = entry.artifact.as_str(),
                path = entry.remote_path.as_str(),
                "deploying"
            );
            self.deployer
                .deploy_artifact(device, &self.store, &entry.artifact, &entry.remote_path, entry.mode)
                .await?;
        }
        Ok(())
    }

    /// Starts the companion service on a device that finished provisioning.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] raised by the start command.
    pub async fn activate<D>(&self, device: &D) -> Result<(), TransportError>
    where
        D: Device + ?Sized,
    {
        let args = [
            String::from("startservice"),
            String::from("-n"),
            String::from(COMPANION_SERVICE),
        ];
        let output = bounded(
            self.operation_timeout,
            "am startservice",
            device.run_command("am", &args),
        )
        .await?;
        info!(
            serial = device.serial(),
            output = output.trim(),
            "companion service started"
        );
        Ok(())
    }
}
