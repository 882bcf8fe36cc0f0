//! Process execution behind a trait so the adapter can be driven by fakes.

use std::ffi::OsString;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use crate::transport::{TransportError, TransportFuture};

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Standard output followed by standard error, skipping empty streams.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> = TransportFuture<'a, CommandOutput>;

/// Byte stream produced by a long-running command.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `program` with `args`, feeding `stdin` when given, and captures
    /// its output.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a>;

    /// Starts `program` and returns its standard output as a stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be started.
    fn stream(&self, program: &str, args: &[OsString]) -> Result<OutputStream, TransportError>;
}

/// Real command runner that spawns host processes.
///
/// Children are killed when their future or stream is dropped, so an
/// abandoned operation does not leave an `adb` process behind.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

fn spawn_error(program: &str, err: &std::io::Error) -> TransportError {
    TransportError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut child = Command::new(program)
                .args(args)
                .stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| spawn_error(program, &err))?;

            if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(bytes)
                    .await
                    .map_err(|err| spawn_error(program, &err))?;
                pipe.shutdown()
                    .await
                    .map_err(|err| spawn_error(program, &err))?;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|err| spawn_error(program, &err))?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn stream(&self, program: &str, args: &[OsString]) -> Result<OutputStream, TransportError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(program, &err))?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            program: program.to_owned(),
            message: String::from("standard output was not captured"),
        })?;
        Ok(Box::new(ChildOutput {
            _child: child,
            stdout,
        }))
    }
}

/// Standard output of a child that lives as long as the reader.
struct ChildOutput {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}
