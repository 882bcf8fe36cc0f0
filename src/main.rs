//! Binary entry point for the droidprov CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use droidprov::{
    AdbTransport, ArtifactError, ArtifactStore, ConfigError, DeviceSummary, Orchestrator,
    OrchestratorError, ProvisionConfig, ProvisioningPipeline, Transport, TransportError, bounded,
};

mod cli;

use cli::{Cli, DevicesCommand, WatchCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("adb error: {0}")]
    Transport(#[from] TransportError),
    #[error("vendor directory error: {0}")]
    Artifacts(#[from] ArtifactError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "droidprov=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Watch(command) => watch(command).await,
        Cli::Devices(command) => devices(command).await,
    }
}

fn load_config() -> Result<ProvisionConfig, CliError> {
    Ok(ProvisionConfig::load_without_cli_args()?)
}

fn apply_overrides(config: &mut ProvisionConfig, command: &WatchCommand) {
    if let Some(server) = &command.server {
        config.server_addr = Some(server.clone());
    }
    if let Some(vendor_dir) = &command.vendor_dir {
        config.vendor_dir.clone_from(vendor_dir);
    }
}

async fn watch(command: WatchCommand) -> Result<(), CliError> {
    let mut config = load_config()?;
    apply_overrides(&mut config, &command);
    config.validate()?;

    let store = ArtifactStore::open(&config.vendor_dir())?;
    let transport = AdbTransport::connect(&config).await?;
    match bounded(config.operation_timeout(), "adb devices", transport.enumerate()).await {
        Ok(attached) => {
            info!(count = attached.len(), "devices attached at startup");
            for device in &attached {
                info!(
                    serial = device.serial.as_str(),
                    state = device.state.as_str(),
                    "attached device"
                );
            }
        }
        Err(err) => warn!(error = %err, "could not list attached devices"),
    }

    let pipeline = ProvisioningPipeline::from_config(store, &config);
    let summary = Orchestrator::new(Arc::new(transport), pipeline)
        .run_until(shutdown_signal())
        .await?;
    info!(
        started = summary.started,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "provisioning stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c, running until the watcher stops");
        std::future::pending::<()>().await;
    }
}

async fn devices(command: DevicesCommand) -> Result<(), CliError> {
    let config = load_config()?;
    config.validate()?;

    let transport = AdbTransport::connect(&config).await?;
    let attached = bounded(config.operation_timeout(), "adb devices", transport.enumerate()).await?;
    write_devices(io::stdout(), &attached, command.json)
}

fn write_devices(
    mut target: impl Write,
    devices: &[DeviceSummary],
    json: bool,
) -> Result<(), CliError> {
    let output_error = |err: io::Error| CliError::Output(err.to_string());
    if json {
        let rendered =
            serde_json::to_string_pretty(devices).map_err(|err| CliError::Output(err.to_string()))?;
        writeln!(target, "{rendered}").map_err(output_error)?;
        return Ok(());
    }
    for device in devices {
        writeln!(target, "{}\t{}", device.serial, device.state).map_err(output_error)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
