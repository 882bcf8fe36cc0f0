//! Shared fixtures and the orchestrator harness for provisioning scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use droidprov::pipeline::PipelineSettings;
use droidprov::test_support::{EventSender, ScriptedDevice, ScriptedTransport, write_vendor_tree};
use droidprov::{
    ArtifactStore, DeviceState, Orchestrator, OrchestratorError, OrchestratorSummary,
    ProvisioningPipeline, StateChange,
};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Scenario state threaded through the steps.
#[derive(Clone, Debug)]
pub struct ProvisioningContext {
    pub devices: BTreeMap<String, ScriptedDevice>,
    pub outcome: Option<ProvisioningOutcome>,
    vendor_root: Utf8PathBuf,
    _vendor_tmp: Arc<TempDir>,
}

impl ProvisioningContext {
    pub fn device(&self, serial: &str) -> Result<&ScriptedDevice, ProvisioningTestError> {
        self.devices
            .get(serial)
            .ok_or_else(|| ProvisioningTestError::UnknownDevice(serial.to_owned()))
    }

    pub fn outcome(&self) -> Result<&ProvisioningOutcome, ProvisioningTestError> {
        self.outcome.as_ref().ok_or(ProvisioningTestError::MissingOutcome)
    }
}

/// What the orchestrator reported once it stopped.
#[derive(Clone, Debug)]
pub struct ProvisioningOutcome {
    pub result: Result<OrchestratorSummary, OrchestratorError>,
    pub transitions: Vec<StateChange>,
}

impl ProvisioningOutcome {
    /// Last state published for `serial`, or `Unknown` when none was.
    pub fn final_state(&self, serial: &str) -> DeviceState {
        self.transitions
            .iter()
            .rev()
            .find(|change| change.serial == serial)
            .map_or(DeviceState::Unknown, |change| change.to)
    }
}

#[derive(Clone, Debug, Error)]
pub enum ProvisioningTestError {
    #[error("failed to prepare vendor tree: {0}")]
    Vendor(String),
    #[error("no scripted device with serial {0}")]
    UnknownDevice(String),
    #[error("the orchestrator has not run")]
    MissingOutcome,
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("orchestrator task failed: {0}")]
    Join(String),
}

pub type ProvisioningContextResult = Result<ProvisioningContext, ProvisioningTestError>;

#[fixture]
pub fn provisioning_context_result() -> ProvisioningContextResult {
    build_provisioning_context()
}

#[fixture]
pub fn provisioning_context(
    provisioning_context_result: ProvisioningContextResult,
) -> ProvisioningContext {
    provisioning_context_result
        .unwrap_or_else(|err| panic!("provisioning context fixture should initialise: {err}"))
}

pub fn build_provisioning_context() -> ProvisioningContextResult {
    let tmp_dir = TempDir::new().map_err(|err| ProvisioningTestError::Vendor(err.to_string()))?;
    let vendor_root = Utf8PathBuf::from_path_buf(tmp_dir.path().join("vendor")).map_err(|path| {
        ProvisioningTestError::Vendor(format!("non-utf8 tempdir path: {}", path.display()))
    })?;
    write_vendor_tree(&vendor_root, "arm64-v8a", "29")
        .map_err(|err| ProvisioningTestError::Vendor(err.to_string()))?;

    Ok(ProvisioningContext {
        devices: BTreeMap::new(),
        outcome: None,
        vendor_root,
        _vendor_tmp: Arc::new(tmp_dir),
    })
}

type RunHandle = JoinHandle<Result<OrchestratorSummary, OrchestratorError>>;

/// A running orchestrator over the context's scripted devices.
pub struct Harness {
    pub events: EventSender,
    changes: mpsc::UnboundedReceiver<StateChange>,
    seen: Vec<StateChange>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: RunHandle,
}

impl Harness {
    /// Starts the orchestrator; must be called inside a runtime.
    pub fn start(context: &ProvisioningContext) -> Result<Self, ProvisioningTestError> {
        let store = ArtifactStore::open(&context.vendor_root)
            .map_err(|err| ProvisioningTestError::Vendor(err.to_string()))?;
        let pipeline = ProvisioningPipeline::new(
            store,
            PipelineSettings {
                operation_timeout: Duration::from_secs(5),
                ..PipelineSettings::default()
            },
        );

        let (transport, events) = ScriptedTransport::new();
        for device in context.devices.values() {
            transport.attach(device);
        }
        let (changes_tx, changes) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let orchestrator =
            Orchestrator::new(Arc::new(transport), pipeline).with_transitions(changes_tx);
        let handle = tokio::spawn(orchestrator.run_until(async move {
            shutdown_rx.await.ok();
        }));

        Ok(Self {
            events,
            changes,
            seen: Vec::new(),
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    /// Waits until `serial` moves from `from` to `to`.
    pub async fn wait_for(
        &mut self,
        serial: &str,
        from: DeviceState,
        to: DeviceState,
    ) -> Result<(), ProvisioningTestError> {
        self.wait_until(serial, |change| change.from == from && change.to == to)
            .await
    }

    /// Waits until `serial` leaves `Provisioning`.
    pub async fn wait_settled(&mut self, serial: &str) -> Result<(), ProvisioningTestError> {
        self.wait_until(serial, |change| {
            change.from == DeviceState::Provisioning
                && matches!(change.to, DeviceState::Ready | DeviceState::Failed)
        })
        .await
    }

    async fn wait_until(
        &mut self,
        serial: &str,
        accept: impl Fn(&StateChange) -> bool,
    ) -> Result<(), ProvisioningTestError> {
        loop {
            let change = timeout(WAIT, self.changes.recv())
                .await
                .map_err(|_| ProvisioningTestError::Timeout(format!("a change of {serial}")))?
                .ok_or_else(|| {
                    ProvisioningTestError::Timeout(format!("{serial}; orchestrator stopped"))
                })?;
            let matched = change.serial == serial && accept(&change);
            self.seen.push(change);
            if matched {
                return Ok(());
            }
        }
    }

    /// Requests shutdown and waits for the orchestrator to return.
    pub async fn stop(mut self) -> Result<ProvisioningOutcome, ProvisioningTestError> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        self.finish().await
    }

    /// Waits for the orchestrator to return on its own.
    pub async fn finish(mut self) -> Result<ProvisioningOutcome, ProvisioningTestError> {
        let result = timeout(WAIT, self.handle)
            .await
            .map_err(|_| ProvisioningTestError::Timeout(String::from("orchestrator to stop")))?
            .map_err(|err| ProvisioningTestError::Join(err.to_string()))?;
        while let Ok(change) = self.changes.try_recv() {
            self.seen.push(change);
        }
        Ok(ProvisioningOutcome {
            result,
            transitions: self.seen,
        })
    }
}
