//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedDevice`] keeps an in-memory file system and interprets the few
//! shell commands the pipeline issues (`mv`, `rm`, `pm`, `am`, the agent), so
//! tests can assert on end state rather than on exact command sequences.
//! [`ScriptedTransport`] hands out scripted devices and an event stream
//! driven through an [`EventSender`]. [`ScriptedRunner`] replays queued
//! process outputs for the `adb` adapter.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::io::AsyncRead;
use tokio::sync::{Semaphore, mpsc};

use crate::adb::{CommandOutput, CommandRunner, OutputStream, RunnerFuture};
use crate::classify::{ABI_PROPERTY, MODEL_PROPERTY, PREVIEW_SDK_PROPERTY, SDK_PROPERTY};
use crate::pipeline::ArtifactLayout;
use crate::transport::{
    Device, DeviceEvent, DeviceSummary, EventStream, Properties, Transport, TransportError,
    TransportFuture, WatcherError,
};

const GATE_RELEASE_PERMITS: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|err| panic!("scripted state lock poisoned: {err}"))
}

#[derive(Debug, Default)]
struct DeviceState {
    properties: Properties,
    fail_properties: bool,
    hold_properties: bool,
    properties_calls: usize,
    fail_stat: bool,
    files: BTreeMap<String, (Vec<u8>, u32)>,
    fail_writes_under: Vec<String>,
    writes: Vec<String>,
    installed: BTreeSet<String>,
    outputs: BTreeMap<String, String>,
    failures: BTreeMap<String, String>,
    commands: Vec<Vec<String>>,
}

/// In-memory device used to drive the pipeline without hardware.
///
/// Clones share state, so a test can keep a clone for assertions while the
/// orchestrator owns another.
#[derive(Clone, Debug)]
pub struct ScriptedDevice {
    serial: String,
    state: Arc<Mutex<DeviceState>>,
    gate: Arc<Semaphore>,
}

impl ScriptedDevice {
    /// Creates a device with no properties, files, or packages.
    #[must_use]
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: Arc::new(Mutex::new(DeviceState::default())),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Creates a device reporting SDK 29, ABI `arm64-v8a`, and preview `0`.
    #[must_use]
    pub fn android_10(serial: impl Into<String>) -> Self {
        Self::new(serial).with_properties(&[
            (SDK_PROPERTY, "29"),
            (ABI_PROPERTY, "arm64-v8a"),
            (PREVIEW_SDK_PROPERTY, "0"),
            (MODEL_PROPERTY, "Pixel 3"),
        ])
    }

    /// Adds properties reported by the device.
    #[must_use]
    pub fn with_properties(self, pairs: &[(&str, &str)]) -> Self {
        {
            let mut state = lock(&self.state);
            for (key, value) in pairs {
                state
                    .properties
                    .insert((*key).to_owned(), (*value).to_owned());
            }
        }
        self
    }

    /// Marks `package_id` as installed.
    pub fn install_package(&self, package_id: &str) {
        lock(&self.state).installed.insert(package_id.to_owned());
    }

    /// Seeds a file on the device, for example a previous deployment.
    pub fn put_file(&self, path: &str, content: &[u8]) {
        lock(&self.state)
            .files
            .insert(path.to_owned(), (content.to_vec(), 0o644));
    }

    /// Sets the output returned by `program`.
    pub fn set_command_output(&self, program: &str, output: &str) {
        lock(&self.state)
            .outputs
            .insert(program.to_owned(), output.to_owned());
    }

    /// Makes `program` exit unsuccessfully with `output`.
    pub fn fail_command(&self, program: &str, output: &str) {
        lock(&self.state)
            .failures
            .insert(program.to_owned(), output.to_owned());
    }

    /// Makes raw writes under `prefix` fail.
    pub fn fail_writes_under(&self, prefix: &str) {
        lock(&self.state).fail_writes_under.push(prefix.to_owned());
    }

    /// Makes property queries fail as if the device were unreachable.
    pub fn fail_properties(&self) {
        lock(&self.state).fail_properties = true;
    }

    /// Makes package queries fail as if the device stopped answering.
    pub fn fail_stat(&self) {
        lock(&self.state).fail_stat = true;
    }

    /// Blocks property queries until [`ScriptedDevice::release`] is called.
    pub fn hold_properties(&self) {
        lock(&self.state).hold_properties = true;
    }

    /// Unblocks property queries held by [`ScriptedDevice::hold_properties`].
    pub fn release(&self) {
        self.gate.add_permits(GATE_RELEASE_PERMITS);
    }

    /// Number of property queries issued so far.
    #[must_use]
    pub fn properties_calls(&self) -> usize {
        lock(&self.state).properties_calls
    }

    /// Every command issued, as `program` followed by its arguments.
    #[must_use]
    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.state).commands.clone()
    }

    /// Number of commands whose program and leading arguments match `prefix`.
    #[must_use]
    pub fn count_commands(&self, prefix: &[&str]) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|command| {
                command.len() >= prefix.len()
                    && command.iter().zip(prefix).all(|(left, right)| left == right)
            })
            .count()
    }

    /// Paths passed to the raw write primitive, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        lock(&self.state).writes.clone()
    }

    /// Content of the file at `path`, if present.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .files
            .get(path)
            .map(|(content, _)| content.clone())
    }

    /// Permission mode of the file at `path`, if present.
    #[must_use]
    pub fn file_mode(&self, path: &str) -> Option<u32> {
        lock(&self.state).files.get(path).map(|(_, mode)| *mode)
    }

    /// Paths of every file currently on the device.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        lock(&self.state).files.keys().cloned().collect()
    }

    fn render(program: &str, args: &[String]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 1);
        parts.push(program.to_owned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    fn interpret(state: &mut DeviceState, program: &str, args: &[String]) -> Result<String, String> {
        match program {
            "mv" => {
                let [source, destination] = args else {
                    return Err(String::from("usage: mv SOURCE DEST"));
                };
                let entry = state
                    .files
                    .remove(source)
                    .ok_or_else(|| format!("mv: {source}: No such file or directory"))?;
                state.files.insert(destination.clone(), entry);
                Ok(String::new())
            }
            "rm" => {
                for path in args.iter().filter(|arg| !arg.starts_with('-')) {
                    state.files.remove(path);
                }
                Ok(String::new())
            }
            "pm" => Ok(state
                .outputs
                .get(program)
                .cloned()
                .unwrap_or_else(|| String::from("Success"))),
            _ => Ok(state.outputs.get(program).cloned().unwrap_or_default()),
        }
    }
}

impl Device for ScriptedDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn properties(&self) -> TransportFuture<'_, Properties> {
        Box::pin(async move {
            let held = {
                let mut state = lock(&self.state);
                state.properties_calls += 1;
                state.hold_properties
            };
            if held {
                let permit = self.gate.acquire().await.map_err(|err| {
                    TransportError::Protocol {
                        message: err.to_string(),
                    }
                })?;
                drop(permit);
            }
            let state = lock(&self.state);
            if state.fail_properties {
                return Err(TransportError::CommandFailed {
                    command: String::from("getprop"),
                    output: format!("error: device '{}' not found", self.serial),
                });
            }
            Ok(state.properties.clone())
        })
    }

    fn run_command<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let mut recorded = vec![program.to_owned()];
            recorded.extend(args.iter().cloned());
            state.commands.push(recorded);

            if let Some(output) = state.failures.get(program) {
                return Err(TransportError::CommandFailed {
                    command: Self::render(program, args),
                    output: output.clone(),
                });
            }

            Self::interpret(&mut state, program, args).map_err(|output| {
                TransportError::CommandFailed {
                    command: Self::render(program, args),
                    output,
                }
            })
        })
    }

    fn write_file<'a>(
        &'a self,
        remote_path: &'a str,
        content: &'a [u8],
        mode: u32,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.writes.push(remote_path.to_owned());
            if state
                .fail_writes_under
                .iter()
                .any(|prefix| remote_path.starts_with(prefix.as_str()))
            {
                // A failed push leaves a truncated file behind.
                let partial = content.split_last().map_or(content, |(_, rest)| rest);
                state
                    .files
                    .insert(remote_path.to_owned(), (partial.to_vec(), mode));
                return Err(TransportError::CommandFailed {
                    command: format!("write {remote_path}"),
                    output: String::from("No space left on device"),
                });
            }
            state
                .files
                .insert(remote_path.to_owned(), (content.to_vec(), mode));
            Ok(())
        })
    }

    fn stat_package<'a>(&'a self, package_id: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let state = lock(&self.state);
            if state.fail_stat {
                return Err(TransportError::CommandFailed {
                    command: format!("pm path {package_id}"),
                    output: String::from("error: closed"),
                });
            }
            Ok(state.installed.contains(package_id))
        })
    }
}

/// Sender half of a [`ScriptedTransport`] event stream.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Result<DeviceEvent, WatcherError>>,
}

impl EventSender {
    /// Emits a `CameOnline` notification.
    pub fn online(&self, serial: &str) {
        self.send(Ok(DeviceEvent::CameOnline {
            serial: serial.to_owned(),
        }));
    }

    /// Emits a `WentOffline` notification.
    pub fn offline(&self, serial: &str) {
        self.send(Ok(DeviceEvent::WentOffline {
            serial: serial.to_owned(),
        }));
    }

    /// Emits a terminal watcher failure.
    pub fn fail(&self, err: WatcherError) {
        self.send(Err(err));
    }

    fn send(&self, item: Result<DeviceEvent, WatcherError>) {
        self.tx
            .send(item)
            .unwrap_or_else(|err| panic!("event stream dropped: {err}"));
    }
}

/// Event stream fed by an [`EventSender`].
#[derive(Debug)]
pub struct ScriptedEvents {
    rx: mpsc::UnboundedReceiver<Result<DeviceEvent, WatcherError>>,
}

impl EventStream for ScriptedEvents {
    fn next_event(&mut self) -> TransportFuture<'_, DeviceEvent, WatcherError> {
        Box::pin(async move { self.rx.recv().await.unwrap_or(Err(WatcherError::Closed)) })
    }
}

/// Transport double handing out [`ScriptedDevice`]s.
#[derive(Debug)]
pub struct ScriptedTransport {
    devices: Mutex<BTreeMap<String, ScriptedDevice>>,
    events: Mutex<Option<ScriptedEvents>>,
    version: String,
}

impl ScriptedTransport {
    /// Creates a transport and the sender that drives its event stream.
    #[must_use]
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            devices: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Some(ScriptedEvents { rx })),
            version: String::from("41"),
        };
        (transport, EventSender { tx })
    }

    /// Registers `device` under its serial.
    pub fn attach(&self, device: &ScriptedDevice) {
        lock(&self.devices).insert(device.serial.clone(), device.clone());
    }
}

impl Transport for ScriptedTransport {
    type Device = ScriptedDevice;
    type Events = ScriptedEvents;

    fn server_version(&self) -> TransportFuture<'_, String> {
        Box::pin(async move { Ok(self.version.clone()) })
    }

    fn enumerate(&self) -> TransportFuture<'_, Vec<DeviceSummary>> {
        Box::pin(async move {
            Ok(lock(&self.devices)
                .keys()
                .map(|serial| DeviceSummary {
                    serial: serial.clone(),
                    state: String::from("device"),
                })
                .collect())
        })
    }

    fn watch(&self) -> TransportFuture<'_, Self::Events, WatcherError> {
        Box::pin(async move {
            lock(&self.events).take().ok_or_else(|| {
                WatcherError::Transport(TransportError::Protocol {
                    message: String::from("scripted event stream already taken"),
                })
            })
        })
    }

    fn device(&self, serial: &str) -> Self::Device {
        lock(&self.devices).get(serial).cloned().unwrap_or_else(|| {
            let device = ScriptedDevice::new(serial);
            device.fail_properties();
            device
        })
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes supplied on standard input, if any.
    pub stdin: Option<Vec<u8>>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<CommandOutput>,
    streams: VecDeque<Vec<u8>>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic `adb` outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Queues the bytes produced by the next streaming command.
    pub fn push_stream(&self, bytes: impl Into<Vec<u8>>) {
        lock(&self.state).streams.push_back(bytes.into());
    }

    fn record(&self, program: &str, args: &[OsString], stdin: Option<&[u8]>) {
        lock(&self.state).invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            self.record(program, args, stdin);
            lock(&self.state)
                .responses
                .pop_front()
                .ok_or_else(|| TransportError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }

    fn stream(&self, program: &str, args: &[OsString]) -> Result<OutputStream, TransportError> {
        self.record(program, args, None);
        let bytes = lock(&self.state)
            .streams
            .pop_front()
            .ok_or_else(|| TransportError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted stream available"),
            })?;
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(bytes));
        Ok(reader)
    }
}

/// Writes a vendor tree matching [`ArtifactLayout`] for `abi` and `sdk`.
///
/// Each artifact's content is its own relative path, which keeps assertions
/// on deployed bytes readable.
///
/// # Errors
///
/// Returns the underlying I/O error when the tree cannot be written.
pub fn write_vendor_tree(root: &Utf8Path, abi: &str, sdk: &str) -> std::io::Result<()> {
    Dir::create_ambient_dir_all(root, ambient_authority())?;
    let dir = Dir::open_ambient_dir(root, ambient_authority())?;
    let layout = ArtifactLayout::default();
    let mut artifacts = layout
        .native_binaries(abi, sdk)
        .into_iter()
        .map(|binary| binary.artifact)
        .collect::<Vec<_>>();
    artifacts.extend(
        layout
            .companion_packages()
            .into_iter()
            .map(|package| package.artifact),
    );
    artifacts.push(layout.agent().artifact);

    for artifact in artifacts {
        if let Some(parent) = artifact.parent().filter(|parent| !parent.as_str().is_empty()) {
            dir.create_dir_all(parent)?;
        }
        dir.write(&artifact, artifact.as_str().as_bytes())?;
    }
    Ok(())
}
