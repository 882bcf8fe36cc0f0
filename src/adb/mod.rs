//! [`Transport`] implementation that drives the host's `adb` executable.
//!
//! The adapter contains no protocol logic of its own: every operation is a
//! single `adb` invocation issued through a [`CommandRunner`], which keeps it
//! testable with [`crate::test_support::ScriptedRunner`].

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::sync::Arc;

use shell_escape::unix::escape;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config::ProvisionConfig;
use crate::transport::{
    Device, DeviceEvent, DeviceSummary, EventStream, Properties, Transport, TransportError,
    TransportFuture, WatcherError, bounded,
};

mod parse;
mod runner;

pub use parse::{
    ONLINE_STATE, Snapshot, diff_snapshots, frame_length, package_path_present, parse_device_list,
    parse_getprop, parse_version, snapshot,
};
pub use runner::{CommandOutput, CommandRunner, OutputStream, ProcessCommandRunner, RunnerFuture};

fn render(program: &str, args: &[OsString]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_owned());
    parts.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn os_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}

/// Runs `adb` and returns its output, mapping a non-zero exit to
/// [`TransportError::CommandFailed`].
async fn invoke<R: CommandRunner>(
    runner: &R,
    adb_bin: &str,
    args: &[OsString],
    stdin: Option<&[u8]>,
) -> Result<String, TransportError> {
    let output = runner.run(adb_bin, args, stdin).await?;
    if output.is_success() {
        return Ok(output.combined());
    }
    Err(TransportError::CommandFailed {
        command: render(adb_bin, args),
        output: output.combined().trim().to_owned(),
    })
}

/// Transport backed by the `adb` command-line client.
#[derive(Debug)]
pub struct AdbTransport<R: CommandRunner = ProcessCommandRunner> {
    adb_bin: String,
    runner: Arc<R>,
}

impl AdbTransport<ProcessCommandRunner> {
    /// Starts the `adb` server if needed and verifies it answers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when `adb` cannot be run, the server fails
    /// to start, or the version check times out.
    pub async fn connect(config: &ProvisionConfig) -> Result<Self, TransportError> {
        let transport = Self::new(config.adb_bin.clone(), ProcessCommandRunner);
        transport.start(config.operation_timeout()).await?;
        Ok(transport)
    }
}

impl<R: CommandRunner> AdbTransport<R> {
    /// Creates a transport invoking `adb_bin` through `runner`.
    #[must_use]
    pub fn new(adb_bin: impl Into<String>, runner: R) -> Self {
        Self {
            adb_bin: adb_bin.into(),
            runner: Arc::new(runner),
        }
    }

    /// Runs `adb start-server` followed by the version check.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when either command fails or exceeds
    /// `limit`.
    pub async fn start(&self, limit: std::time::Duration) -> Result<String, TransportError> {
        let args = os_args(["start-server"]);
        bounded(
            limit,
            "adb start-server",
            invoke(&*self.runner, &self.adb_bin, &args, None),
        )
        .await?;
        let version = bounded(limit, "adb version", self.server_version()).await?;
        info!(adb = self.adb_bin.as_str(), version = version.as_str(), "adb server ready");
        Ok(version)
    }
}

impl<R: CommandRunner> Transport for AdbTransport<R> {
    type Device = AdbDevice<R>;
    type Events = AdbEvents;

    fn server_version(&self) -> TransportFuture<'_, String> {
        Box::pin(async move {
            let args = os_args(["version"]);
            let output = invoke(&*self.runner, &self.adb_bin, &args, None).await?;
            parse_version(&output)
        })
    }

    fn enumerate(&self) -> TransportFuture<'_, Vec<DeviceSummary>> {
        Box::pin(async move {
            let args = os_args(["devices"]);
            let output = invoke(&*self.runner, &self.adb_bin, &args, None).await?;
            Ok(parse_device_list(&output))
        })
    }

    fn watch(&self) -> TransportFuture<'_, Self::Events, WatcherError> {
        Box::pin(async move {
            let args = os_args(["track-devices"]);
            let reader = self.runner.stream(&self.adb_bin, &args)?;
            debug!(adb = self.adb_bin.as_str(), "tracking devices");
            Ok(AdbEvents {
                reader,
                known: Snapshot::new(),
                pending: VecDeque::new(),
            })
        })
    }

    fn device(&self, serial: &str) -> Self::Device {
        AdbDevice {
            adb_bin: self.adb_bin.clone(),
            runner: Arc::clone(&self.runner),
            serial: serial.to_owned(),
        }
    }
}

/// Handle addressing one device with `adb -s <serial>`.
#[derive(Debug)]
pub struct AdbDevice<R: CommandRunner = ProcessCommandRunner> {
    adb_bin: String,
    runner: Arc<R>,
    serial: String,
}

impl<R: CommandRunner> AdbDevice<R> {
    fn args(&self, rest: &[&str]) -> Vec<OsString> {
        let mut args = vec![OsString::from("-s"), OsString::from(&self.serial)];
        args.extend(rest.iter().map(OsString::from));
        args
    }

    async fn shell(&self, command: &str) -> Result<String, TransportError> {
        let args = self.args(&["shell", command]);
        invoke(&*self.runner, &self.adb_bin, &args, None).await
    }
}

/// Joins `program` and `args` into one shell-escaped command line.
#[must_use]
pub fn shell_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(escape(program.into()).into_owned());
    parts.extend(args.iter().map(|arg| escape(arg.as_str().into()).into_owned()));
    parts.join(" ")
}

impl<R: CommandRunner> Device for AdbDevice<R> {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn properties(&self) -> TransportFuture<'_, Properties> {
        Box::pin(async move {
            let output = self.shell("getprop").await?;
            Ok(parse_getprop(&output))
        })
    }

    fn run_command<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> TransportFuture<'a, String> {
        Box::pin(async move { self.shell(&shell_command(program, args)).await })
    }

    fn write_file<'a>(
        &'a self,
        remote_path: &'a str,
        content: &'a [u8],
        mode: u32,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let path = escape(remote_path.into());
            let script = format!("cat > {path} && chmod {mode:o} {path}");
            let args = self.args(&["exec-in", script.as_str()]);
            invoke(&*self.runner, &self.adb_bin, &args, Some(content)).await?;
            Ok(())
        })
    }

    fn stat_package<'a>(&'a self, package_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            match self.run_command("pm", &[String::from("path"), package_id.to_owned()]).await {
                Ok(output) => Ok(package_path_present(&output)),
                // `pm path` exits non-zero for unknown packages.
                Err(TransportError::CommandFailed { .. }) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }
}

/// Attach/detach events decoded from `adb track-devices`.
pub struct AdbEvents {
    reader: OutputStream,
    known: Snapshot,
    pending: VecDeque<DeviceEvent>,
}

impl std::fmt::Debug for AdbEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbEvents")
            .field("known", &self.known)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl AdbEvents {
    async fn read_frame(&mut self) -> Result<String, WatcherError> {
        let mut prefix = [0_u8; 4];
        self.reader
            .read_exact(&mut prefix)
            .await
            .map_err(|err| closed_or_failed(&err))?;
        let mut body = vec![0_u8; frame_length(prefix)?];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|err| closed_or_failed(&err))?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn closed_or_failed(err: &std::io::Error) -> WatcherError {
    if err.kind() == ErrorKind::UnexpectedEof {
        return WatcherError::Closed;
    }
    WatcherError::Transport(TransportError::Protocol {
        message: format!("track-devices read failed: {err}"),
    })
}

impl EventStream for AdbEvents {
    fn next_event(&mut self) -> TransportFuture<'_, DeviceEvent, WatcherError> {
        Box::pin(async move {
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Ok(event);
                }
                let frame = self.read_frame().await?;
                let current = snapshot(parse_device_list(&frame));
                self.pending.extend(diff_snapshots(&self.known, &current));
                self.known = current;
            }
        })
    }
}
