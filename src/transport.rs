//! Contract for the device-control transport consumed by the orchestrator.
//!
//! The transport enumerates attached devices, streams attach/detach
//! notifications, and hands out [`Device`] handles that execute remote
//! commands and write files. Everything above this module is written against
//! these traits so the `adb` adapter and the scripted test doubles are
//! interchangeable.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;

/// Property mapping reported by a device (`getprop` keys to values).
pub type Properties = BTreeMap<String, String>;

/// Future returned by transport operations.
pub type TransportFuture<'a, T, E = TransportError> =
    Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Attach or detach notification for a single device serial.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    /// The device became available for commands.
    CameOnline {
        /// Stable identifier of the device.
        serial: String,
    },
    /// The device is no longer available.
    WentOffline {
        /// Stable identifier of the device.
        serial: String,
    },
}

impl DeviceEvent {
    /// Returns the serial the event refers to.
    #[must_use]
    pub fn serial(&self) -> &str {
        match self {
            Self::CameOnline { serial } | Self::WentOffline { serial } => serial,
        }
    }
}

/// Entry returned by [`Transport::enumerate`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceSummary {
    /// Device serial.
    pub serial: String,
    /// Connection state as reported by the transport (for example `device`
    /// or `unauthorized`).
    pub state: String,
}

/// Errors raised by individual transport operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the transport executable cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote command exits unsuccessfully.
    #[error("`{command}` failed: {output}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Combined output captured from the command.
        output: String,
    },
    /// Raised when an operation does not finish within its time budget.
    #[error("{operation} timed out after {}s", limit.as_secs())]
    Timeout {
        /// Operation that was abandoned.
        operation: String,
        /// Limit that was exceeded.
        limit: Duration,
    },
    /// Raised when the transport returns output that cannot be interpreted.
    #[error("unexpected transport output: {message}")]
    Protocol {
        /// Description of the malformed output.
        message: String,
    },
}

/// Errors raised by the attach/detach notification stream.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WatcherError {
    /// Raised when the underlying transport fails.
    #[error("device watcher failed: {0}")]
    Transport(#[from] TransportError),
    /// Raised when the notification stream ends.
    #[error("device watcher stream closed")]
    Closed,
}

/// Handle to a single attached device.
///
/// Handles are capability references into the transport and are only
/// meaningful while the device stays attached.
pub trait Device: Send + Sync {
    /// Returns the serial this handle refers to.
    fn serial(&self) -> &str;

    /// Fetches the full property mapping in one round trip.
    fn properties(&self) -> TransportFuture<'_, Properties>;

    /// Runs `program` with `args` on the device and returns its combined
    /// output.
    ///
    /// A non-zero exit status is reported as
    /// [`TransportError::CommandFailed`].
    fn run_command<'a>(&'a self, program: &'a str, args: &'a [String])
    -> TransportFuture<'a, String>;

    /// Writes `content` to `remote_path` with permission `mode`.
    ///
    /// This is the raw, non-atomic primitive; see
    /// [`crate::deploy::AtomicDeployer`] for the atomic variant.
    fn write_file<'a>(
        &'a self,
        remote_path: &'a str,
        content: &'a [u8],
        mode: u32,
    ) -> TransportFuture<'a, ()>;

    /// Reports whether `package_id` is installed.
    fn stat_package<'a>(&'a self, package_id: &'a str) -> TransportFuture<'a, bool>;
}

/// Ordered stream of attach/detach notifications.
pub trait EventStream: Send {
    /// Waits for the next notification.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError`] when the stream fails or ends; both are
    /// terminal.
    fn next_event(&mut self) -> TransportFuture<'_, DeviceEvent, WatcherError>;
}

/// Device-control transport injected into the orchestrator at startup.
pub trait Transport: Send + Sync + 'static {
    /// Device handle type produced by [`Transport::device`].
    type Device: Device + 'static;
    /// Notification stream produced by [`Transport::watch`].
    type Events: EventStream + 'static;

    /// Returns the transport server version, used to verify connectivity.
    fn server_version(&self) -> TransportFuture<'_, String>;

    /// Lists currently attached devices.
    fn enumerate(&self) -> TransportFuture<'_, Vec<DeviceSummary>>;

    /// Opens the attach/detach notification stream.
    fn watch(&self) -> TransportFuture<'_, Self::Events, WatcherError>;

    /// Returns a handle for `serial`.
    fn device(&self, serial: &str) -> Self::Device;
}

/// Runs `future`, failing with [`TransportError::Timeout`] when it takes
/// longer than `limit`.
///
/// # Errors
///
/// Returns the error produced by `future`, or a timeout error.
pub async fn bounded<T, F>(limit: Duration, operation: &str, future: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    timeout(limit, future)
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                operation: operation.to_owned(),
                limit,
            })
        })
}
