//! Per-serial provisioning state.
//!
//! Each attach cycle bumps the serial's epoch. A run carries the epoch it was
//! started for, so a result arriving after a detach (or after a detach and
//! re-attach) is recognised as stale and discarded.

use std::collections::HashMap;
use std::fmt;

/// Provisioning state of one device serial.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DeviceState {
    /// Not attached, or never seen.
    #[default]
    Unknown,
    /// Attached with a pipeline run pending or in flight.
    Provisioning,
    /// Provisioned successfully during the current attach cycle.
    Ready,
    /// Provisioning failed during the current attach cycle.
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

/// Identifies one pipeline run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunTicket {
    /// Device the run targets.
    pub serial: String,
    /// Attach cycle the run was started for.
    pub epoch: u64,
}

/// What to do with a `CameOnline` notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OnlineDecision {
    /// Start a run for the ticket.
    Start(RunTicket),
    /// A stale run is still in flight; the new run starts when it finishes.
    Deferred,
    /// The serial is already provisioning or ready.
    Ignored(DeviceState),
}

/// How to treat a finished run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunVerdict {
    /// The run belongs to the current attach cycle; its result was applied.
    Current,
    /// The device detached while the run was in flight.
    Stale {
        /// Deferred run to start now, if the device re-attached meanwhile.
        restart: Option<RunTicket>,
    },
}

#[derive(Clone, Debug, Default)]
struct Entry {
    state: DeviceState,
    epoch: u64,
    in_flight: Option<u64>,
}

/// State machine for every serial seen by the orchestrator.
///
/// Owned by the orchestrator loop; never shared.
#[derive(Debug, Default)]
pub struct StateTable {
    entries: HashMap<String, Entry>,
}

impl StateTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `serial`.
    #[must_use]
    pub fn state(&self, serial: &str) -> DeviceState {
        self.entries
            .get(serial)
            .map_or(DeviceState::Unknown, |entry| entry.state)
    }

    /// Number of runs currently in flight.
    #[cfg(test)]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.in_flight.is_some())
            .count()
    }

    /// Handles an attach notification.
    pub fn came_online(&mut self, serial: &str) -> OnlineDecision {
        let entry = self.entries.entry(serial.to_owned()).or_default();
        match entry.state {
            DeviceState::Provisioning | DeviceState::Ready => OnlineDecision::Ignored(entry.state),
            DeviceState::Unknown | DeviceState::Failed => {
                entry.epoch += 1;
                entry.state = DeviceState::Provisioning;
                if entry.in_flight.is_some() {
                    return OnlineDecision::Deferred;
                }
                entry.in_flight = Some(entry.epoch);
                OnlineDecision::Start(RunTicket {
                    serial: serial.to_owned(),
                    epoch: entry.epoch,
                })
            }
        }
    }

    /// Handles a detach notification and returns the previous state.
    pub fn went_offline(&mut self, serial: &str) -> DeviceState {
        let Some(entry) = self.entries.get_mut(serial) else {
            return DeviceState::Unknown;
        };
        let previous = entry.state;
        entry.state = DeviceState::Unknown;
        if entry.in_flight.is_none() {
            self.entries.remove(serial);
        }
        previous
    }

    /// Records that the run for `ticket` finished.
    pub fn run_finished(&mut self, ticket: &RunTicket, succeeded: bool) -> RunVerdict {
        let Some(entry) = self.entries.get_mut(&ticket.serial) else {
            return RunVerdict::Stale { restart: None };
        };
        if entry.in_flight == Some(ticket.epoch) {
            entry.in_flight = None;
        }

        match entry.state {
            DeviceState::Provisioning if entry.epoch == ticket.epoch => {
                entry.state = if succeeded {
                    DeviceState::Ready
                } else {
                    DeviceState::Failed
                };
                RunVerdict::Current
            }
            DeviceState::Provisioning if entry.in_flight.is_none() => {
                entry.in_flight = Some(entry.epoch);
                RunVerdict::Stale {
                    restart: Some(RunTicket {
                        serial: ticket.serial.clone(),
                        epoch: entry.epoch,
                    }),
                }
            }
            DeviceState::Unknown if entry.in_flight.is_none() => {
                self.entries.remove(&ticket.serial);
                RunVerdict::Stale { restart: None }
            }
            _ => RunVerdict::Stale { restart: None },
        }
    }
}
