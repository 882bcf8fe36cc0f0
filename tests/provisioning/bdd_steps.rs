//! BDD step definitions for the provisioning orchestrator.

use std::future::Future;

use droidprov::pipeline::{COMPANION_SERVICE, MAIN_PACKAGE_ID, TEST_PACKAGE_ID};
use droidprov::test_support::ScriptedDevice;
use droidprov::{DeviceState, OrchestratorSummary, TransportError, WatcherError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    Harness, ProvisioningContext, ProvisioningOutcome, ProvisioningTestError,
};

const AGENT_PATH: &str = "/data/local/tmp/atx-agent";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] ProvisioningTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn parse_state(raw: &str) -> Result<DeviceState, StepError> {
    match raw {
        "unknown" => Ok(DeviceState::Unknown),
        "provisioning" => Ok(DeviceState::Provisioning),
        "ready" => Ok(DeviceState::Ready),
        "failed" => Ok(DeviceState::Failed),
        other => Err(StepError::Assertion(format!("unknown device state {other}"))),
    }
}

fn summary(provisioning_context: &ProvisioningContext) -> Result<OrchestratorSummary, StepError> {
    match &provisioning_context.outcome()?.result {
        Ok(summary) => Ok(*summary),
        Err(err) => Err(StepError::Assertion(format!(
            "orchestrator failed unexpectedly: {err}"
        ))),
    }
}

fn service_starts(device: &ScriptedDevice) -> usize {
    device.count_commands(&["am", "startservice", "-n", COMPANION_SERVICE])
}

/// Runs the orchestrator over the scenario's devices, driving it with
/// `script`, and stores what it reported.
fn orchestrate<F, Fut>(
    mut provisioning_context: ProvisioningContext,
    script: F,
) -> Result<ProvisioningContext, StepError>
where
    F: FnOnce(Harness, ProvisioningContext) -> Fut,
    Fut: Future<Output = Result<ProvisioningOutcome, ProvisioningTestError>>,
{
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let snapshot = provisioning_context.clone();
    let outcome = runtime.block_on(async move {
        let harness = Harness::start(&snapshot)?;
        script(harness, snapshot).await
    })?;
    provisioning_context.outcome = Some(outcome);
    Ok(provisioning_context)
}

#[given("a device \"{serial}\"")]
fn device_attached(
    mut provisioning_context: ProvisioningContext,
    serial: String,
) -> ProvisioningContext {
    provisioning_context
        .devices
        .insert(serial.clone(), ScriptedDevice::android_10(serial));
    provisioning_context
}

#[given("both companion packages are installed on \"{serial}\"")]
fn packages_installed(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    let device = provisioning_context.device(&serial)?;
    device.install_package(MAIN_PACKAGE_ID);
    device.install_package(TEST_PACKAGE_ID);
    Ok(provisioning_context)
}

#[given("the agent on \"{serial}\" prints \"{output}\"")]
fn agent_prints(
    provisioning_context: ProvisioningContext,
    serial: String,
    output: String,
) -> Result<ProvisioningContext, StepError> {
    provisioning_context
        .device(&serial)?
        .set_command_output(AGENT_PATH, &output);
    Ok(provisioning_context)
}

#[given("the package manager on \"{serial}\" answers \"{output}\"")]
fn package_manager_answers(
    provisioning_context: ProvisioningContext,
    serial: String,
    output: String,
) -> Result<ProvisioningContext, StepError> {
    provisioning_context
        .device(&serial)?
        .set_command_output("pm", &output);
    Ok(provisioning_context)
}

#[given("moving files on \"{serial}\" fails with \"{output}\"")]
fn moves_fail(
    provisioning_context: ProvisioningContext,
    serial: String,
    output: String,
) -> Result<ProvisioningContext, StepError> {
    provisioning_context
        .device(&serial)?
        .fail_command("mv", &output);
    Ok(provisioning_context)
}

#[when("\"{serial}\" attaches and provisioning settles")]
fn attach_and_settle(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness.wait_settled(&serial).await?;
        harness.stop().await
    })
}

#[when("\"{serial}\" attaches twice before \"{other}\" attaches")]
fn attach_twice(
    provisioning_context: ProvisioningContext,
    serial: String,
    other: String,
) -> Result<ProvisioningContext, StepError> {
    let held = provisioning_context.device(&serial)?.clone();
    held.hold_properties();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness.events.online(&serial);
        harness.events.online(&other);
        // Notifications are handled in order, so the second device settling
        // means both duplicates were seen while the first run was held.
        harness.wait_settled(&other).await?;
        held.release();
        harness.wait_settled(&serial).await?;
        harness.stop().await
    })
}

#[when("\"{serial}\" detaches while provisioning")]
fn detach_while_provisioning(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    let held = provisioning_context.device(&serial)?.clone();
    held.hold_properties();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness
            .wait_for(&serial, DeviceState::Unknown, DeviceState::Provisioning)
            .await?;
        harness.events.offline(&serial);
        harness
            .wait_for(&serial, DeviceState::Provisioning, DeviceState::Unknown)
            .await?;
        held.release();
        harness.stop().await
    })
}

#[when("\"{serial}\" re-attaches while its stale run is in flight")]
fn reattach_during_stale_run(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    let held = provisioning_context.device(&serial)?.clone();
    held.hold_properties();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness
            .wait_for(&serial, DeviceState::Unknown, DeviceState::Provisioning)
            .await?;
        harness.events.offline(&serial);
        harness
            .wait_for(&serial, DeviceState::Provisioning, DeviceState::Unknown)
            .await?;
        harness.events.online(&serial);
        harness
            .wait_for(&serial, DeviceState::Unknown, DeviceState::Provisioning)
            .await?;
        held.release();
        harness.wait_settled(&serial).await?;
        harness.stop().await
    })
}

#[when("\"{serial}\" fails, detaches and re-attaches with a working package manager")]
fn retry_after_failure(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    let device = provisioning_context.device(&serial)?.clone();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness
            .wait_for(&serial, DeviceState::Provisioning, DeviceState::Failed)
            .await?;
        harness.events.offline(&serial);
        harness
            .wait_for(&serial, DeviceState::Failed, DeviceState::Unknown)
            .await?;
        device.set_command_output("pm", "Success");
        harness.events.online(&serial);
        harness.wait_settled(&serial).await?;
        harness.stop().await
    })
}

#[when("\"{first}\" and \"{second}\" attach together")]
fn attach_together(
    provisioning_context: ProvisioningContext,
    first: String,
    second: String,
) -> Result<ProvisioningContext, StepError> {
    let held = provisioning_context.device(&first)?.clone();
    held.hold_properties();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&first);
        harness.events.online(&second);
        // The second device settles while the first run is still held.
        harness.wait_settled(&second).await?;
        held.release();
        harness.wait_settled(&first).await?;
        harness.stop().await
    })
}

#[when("the device watcher fails while \"{serial}\" is provisioning")]
fn watcher_fails_during_run(
    provisioning_context: ProvisioningContext,
    serial: String,
) -> Result<ProvisioningContext, StepError> {
    let held = provisioning_context.device(&serial)?.clone();
    held.hold_properties();
    orchestrate(provisioning_context, move |mut harness, _| async move {
        harness.events.online(&serial);
        harness
            .wait_for(&serial, DeviceState::Unknown, DeviceState::Provisioning)
            .await?;
        harness
            .events
            .fail(WatcherError::Transport(TransportError::Protocol {
                message: String::from("track-devices read failed"),
            }));
        held.release();
        harness.finish().await
    })
}

#[when("the device watcher stream ends")]
fn watcher_stream_ends(
    provisioning_context: ProvisioningContext,
) -> Result<ProvisioningContext, StepError> {
    orchestrate(provisioning_context, |harness, _| async move {
        harness.events.fail(WatcherError::Closed);
        harness.finish().await
    })
}

#[when("the orchestrator is stopped before any device attaches")]
fn stop_immediately(
    provisioning_context: ProvisioningContext,
) -> Result<ProvisioningContext, StepError> {
    orchestrate(provisioning_context, |harness, _| harness.stop())
}

#[then("\"{serial}\" is \"{state}\"")]
fn device_is(
    provisioning_context: &ProvisioningContext,
    serial: String,
    state: String,
) -> Result<(), StepError> {
    let expected = parse_state(&state)?;
    let actual = provisioning_context.outcome()?.final_state(&serial);
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {serial} to be {expected}, got {actual}"
        )))
    }
}

#[then("\"{count}\" packages were installed on \"{serial}\"")]
fn packages_installed_count(
    provisioning_context: &ProvisioningContext,
    count: usize,
    serial: String,
) -> Result<(), StepError> {
    let installs = provisioning_context
        .device(&serial)?
        .count_commands(&["pm", "install"]);
    if installs == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} package installs, got {installs}"
        )))
    }
}

#[then("the agent was launched on \"{serial}\"")]
fn agent_launched(
    provisioning_context: &ProvisioningContext,
    serial: String,
) -> Result<(), StepError> {
    let launches = provisioning_context
        .device(&serial)?
        .count_commands(&[AGENT_PATH, "-d"]);
    if launches == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one agent launch, got {launches}"
        )))
    }
}

#[then("the agent was not launched on \"{serial}\"")]
fn agent_not_launched(
    provisioning_context: &ProvisioningContext,
    serial: String,
) -> Result<(), StepError> {
    let device = provisioning_context.device(&serial)?;
    if device.count_commands(&[AGENT_PATH]) == 0 && device.file(AGENT_PATH).is_none() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "the agent should be neither deployed nor launched",
        )))
    }
}

#[then("the companion service started \"{count}\" times on \"{serial}\"")]
fn companion_service_started(
    provisioning_context: &ProvisioningContext,
    count: usize,
    serial: String,
) -> Result<(), StepError> {
    let starts = service_starts(provisioning_context.device(&serial)?);
    if starts == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} service starts, got {starts}"
        )))
    }
}

#[then("properties were queried \"{count}\" times on \"{serial}\"")]
fn properties_queried(
    provisioning_context: &ProvisioningContext,
    count: usize,
    serial: String,
) -> Result<(), StepError> {
    let calls = provisioning_context.device(&serial)?.properties_calls();
    if calls == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} property queries, got {calls}"
        )))
    }
}

#[then(
    "the summary counts \"{started}\" started, \"{succeeded}\" succeeded, \"{failed}\" failed and \"{discarded}\" discarded"
)]
fn summary_counts(
    provisioning_context: &ProvisioningContext,
    started: usize,
    succeeded: usize,
    failed: usize,
    discarded: usize,
) -> Result<(), StepError> {
    let expected = OrchestratorSummary {
        started,
        succeeded,
        failed,
        discarded,
    };
    let actual = summary(provisioning_context)?;
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, got {actual:?}"
        )))
    }
}

#[then("the orchestrator stops with \"{message}\"")]
fn orchestrator_stops_with(
    provisioning_context: &ProvisioningContext,
    message: String,
) -> Result<(), StepError> {
    match &provisioning_context.outcome()?.result {
        Err(err) if err.to_string().contains(message.as_str()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an error mentioning {message}, got {other:?}"
        ))),
    }
}
