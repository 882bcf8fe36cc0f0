//! Event loop that keeps every attached device provisioned.
//!
//! The loop is the only writer of the [`StateTable`]. Attach notifications
//! start pipeline runs on a [`JoinSet`]; finished runs report back through
//! the same set, so state changes for all serials happen on one task and
//! runs for different devices proceed in parallel.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::pipeline::{ProvisioningPipeline, ProvisioningResult};
use crate::transport::{DeviceEvent, Transport, WatcherError};

mod state;
mod watcher;

pub use state::{DeviceState, OnlineDecision, RunTicket, RunVerdict, StateTable};

use watcher::{EVENT_BUFFER, WatchItem, forward_events};

/// Errors that stop the orchestrator.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestratorError {
    /// The device watcher failed or its stream ended.
    #[error(transparent)]
    Watcher(#[from] WatcherError),
}

/// A state change of one serial, published to observers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateChange {
    /// Device whose state changed.
    pub serial: String,
    /// State before the change.
    pub from: DeviceState,
    /// State after the change.
    pub to: DeviceState,
}

/// Counters reported when the orchestrator stops.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OrchestratorSummary {
    /// Pipeline runs started.
    pub started: usize,
    /// Runs whose success was applied.
    pub succeeded: usize,
    /// Runs whose failure was applied.
    pub failed: usize,
    /// Runs whose result was discarded because the device detached.
    pub discarded: usize,
}

struct RunOutcome {
    ticket: RunTicket,
    result: Result<ProvisioningResult, JoinError>,
}

/// Whether finished runs may start deferred runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Accepting,
    Draining,
}

/// Drives provisioning from device attach and detach notifications.
pub struct Orchestrator<T: Transport> {
    transport: Arc<T>,
    pipeline: Arc<ProvisioningPipeline>,
    transitions: Option<mpsc::UnboundedSender<StateChange>>,
}

impl<T: Transport> std::fmt::Debug for Orchestrator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline)
            .field("observed", &self.transitions.is_some())
            .finish_non_exhaustive()
    }
}

struct LoopState {
    table: StateTable,
    runs: JoinSet<RunOutcome>,
    activations: JoinSet<()>,
    summary: OrchestratorSummary,
}

impl<T: Transport> Orchestrator<T> {
    /// Creates an orchestrator driving `pipeline` over `transport`.
    #[must_use]
    pub fn new(transport: Arc<T>, pipeline: ProvisioningPipeline) -> Self {
        Self {
            transport,
            pipeline: Arc::new(pipeline),
            transitions: None,
        }
    }

    /// Publishes every state change to `observer`.
    #[must_use]
    pub fn with_transitions(mut self, observer: mpsc::UnboundedSender<StateChange>) -> Self {
        self.transitions = Some(observer);
        self
    }

    /// Runs until the device watcher fails.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Watcher`] once in-flight runs have
    /// finished.
    pub async fn run(self) -> Result<OrchestratorSummary, OrchestratorError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs until `shutdown` resolves or the device watcher fails.
    ///
    /// Either way no further notifications are accepted, and the call returns
    /// only after in-flight runs and service starts have finished.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Watcher`] when the watcher cannot be
    /// opened, fails, or ends.
    pub async fn run_until<F>(self, shutdown: F) -> Result<OrchestratorSummary, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        let events = self.transport.watch().await?;
        let (tx, mut rx) = mpsc::channel::<WatchItem>(EVENT_BUFFER);
        let forwarder = tokio::spawn(forward_events(events, tx));
        info!("watching for devices");

        let mut state = LoopState {
            table: StateTable::new(),
            runs: JoinSet::new(),
            activations: JoinSet::new(),
            summary: OrchestratorSummary::default(),
        };
        tokio::pin!(shutdown);

        let stopped = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                item = rx.recv() => match item {
                    Some(Ok(event)) => self.handle_event(&mut state, event),
                    Some(Err(err)) => break Err(err),
                    None => break Err(WatcherError::Closed),
                },
                Some(joined) = state.runs.join_next(), if !state.runs.is_empty() => {
                    self.handle_joined(&mut state, joined, Phase::Accepting);
                }
                Some(joined) = state.activations.join_next(), if !state.activations.is_empty() => {
                    log_activation_join(joined);
                }
            }
        };
        forwarder.abort();

        self.drain(&mut state).await;
        let summary = state.summary;
        info!(
            started = summary.started,
            succeeded = summary.succeeded,
            failed = summary.failed,
            discarded = summary.discarded,
            "orchestrator stopped"
        );
        match stopped {
            Ok(()) => Ok(summary),
            Err(err) => {
                error!(error = %err, "device watcher stopped");
                Err(OrchestratorError::Watcher(err))
            }
        }
    }

    async fn drain(&self, state: &mut LoopState) {
        if !state.runs.is_empty() {
            info!(in_flight = state.runs.len(), "waiting for in-flight runs");
        }
        while let Some(joined) = state.runs.join_next().await {
            self.handle_joined(state, joined, Phase::Draining);
        }
        while let Some(joined) = state.activations.join_next().await {
            log_activation_join(joined);
        }
    }

    fn handle_event(&self, state: &mut LoopState, event: DeviceEvent) {
        match event {
            DeviceEvent::CameOnline { serial } => {
                let before = state.table.state(&serial);
                match state.table.came_online(&serial) {
                    OnlineDecision::Start(ticket) => {
                        info!(serial = serial.as_str(), "device online, provisioning");
                        self.start_run(state, ticket);
                    }
                    OnlineDecision::Deferred => {
                        info!(
                            serial = serial.as_str(),
                            "device online, waiting for previous run to finish"
                        );
                    }
                    OnlineDecision::Ignored(current) => {
                        debug!(
                            serial = serial.as_str(),
                            state = %current,
                            "ignoring duplicate online notification"
                        );
                    }
                }
                self.publish(&serial, before, state.table.state(&serial));
            }
            DeviceEvent::WentOffline { serial } => {
                let before = state.table.went_offline(&serial);
                if before != DeviceState::Unknown {
                    info!(serial = serial.as_str(), previous = %before, "device offline");
                }
                self.publish(&serial, before, DeviceState::Unknown);
            }
        }
    }

    fn start_run(&self, state: &mut LoopState, ticket: RunTicket) {
        state.summary.started += 1;
        let transport = Arc::clone(&self.transport);
        let pipeline = Arc::clone(&self.pipeline);
        let serial = ticket.serial.clone();
        // The inner task turns a panicking run into a JoinError while the
        // ticket stays with the outer one.
        state.runs.spawn(async move {
            let run = tokio::spawn(async move {
                let device = transport.device(&serial);
                pipeline.run(&device).await
            });
            RunOutcome {
                ticket,
                result: run.await,
            }
        });
    }

    fn handle_joined(
        &self,
        state: &mut LoopState,
        joined: Result<RunOutcome, JoinError>,
        phase: Phase,
    ) {
        match joined {
            Ok(outcome) => self.handle_finished(state, outcome, phase),
            Err(err) => error!(error = %err, "pipeline supervisor task failed"),
        }
    }

    fn handle_finished(&self, state: &mut LoopState, outcome: RunOutcome, phase: Phase) {
        let RunOutcome { ticket, result } = outcome;
        let succeeded = match &result {
            Ok(provisioned) => provisioned.is_success(),
            Err(err) => {
                error!(serial = ticket.serial.as_str(), error = %err, "pipeline run panicked");
                false
            }
        };

        let before = state.table.state(&ticket.serial);
        match state.table.run_finished(&ticket, succeeded) {
            RunVerdict::Current => {
                let after = state.table.state(&ticket.serial);
                if succeeded {
                    state.summary.succeeded += 1;
                    info!(serial = ticket.serial.as_str(), "device ready");
                    self.activate(state, ticket.serial.clone());
                } else {
                    state.summary.failed += 1;
                }
                self.publish(&ticket.serial, before, after);
            }
            RunVerdict::Stale { restart } => {
                state.summary.discarded += 1;
                info!(
                    serial = ticket.serial.as_str(),
                    "device went offline during provisioning, discarding result"
                );
                match (restart, phase) {
                    (Some(next), Phase::Accepting) => {
                        info!(serial = next.serial.as_str(), "starting deferred run");
                        self.start_run(state, next);
                    }
                    (Some(next), Phase::Draining) => {
                        debug!(serial = next.serial.as_str(), "shutting down, deferred run dropped");
                    }
                    (None, _) => {}
                }
            }
        }
    }

    fn activate(&self, state: &mut LoopState, serial: String) {
        let transport = Arc::clone(&self.transport);
        let pipeline = Arc::clone(&self.pipeline);
        state.activations.spawn(async move {
            let device = transport.device(&serial);
            if let Err(err) = pipeline.activate(&device).await {
                warn!(
                    serial = serial.as_str(),
                    error = %err,
                    "failed to start companion service"
                );
            }
        });
    }

    fn publish(&self, serial: &str, from: DeviceState, to: DeviceState) {
        if from == to {
            return;
        }
        if let Some(observer) = &self.transitions {
            let change = StateChange {
                serial: serial.to_owned(),
                from,
                to,
            };
            if observer.send(change).is_err() {
                debug!(serial, "state observer dropped");
            }
        }
    }
}

fn log_activation_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "companion service task failed");
    }
}
