//! Command-line interface definitions for the `droidprov` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `droidprov` binary.
#[derive(Debug, Parser)]
#[command(
    name = "droidprov",
    about = "Provision attached Android devices with the automation agent",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Watch for devices and provision each one as it attaches.
    #[command(name = "watch", about = "Watch for devices and provision each one as it attaches")]
    Watch(WatchCommand),
    /// List devices currently attached.
    #[command(name = "devices", about = "List devices currently attached")]
    Devices(DevicesCommand),
}

/// Arguments for the `droidprov watch` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct WatchCommand {
    /// Server the agent registers with (`host:port`).
    ///
    /// Overrides `server_addr` from configuration. The address is passed to
    /// the agent as `-t <ADDR>` when it is launched.
    #[arg(long, value_name = "ADDR")]
    pub(crate) server: Option<String>,
    /// Directory holding the binaries and packages to deploy.
    #[arg(long, value_name = "DIR")]
    pub(crate) vendor_dir: Option<String>,
}

/// Arguments for the `droidprov devices` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DevicesCommand {
    /// Print the device list as JSON.
    #[arg(long)]
    pub(crate) json: bool,
}
