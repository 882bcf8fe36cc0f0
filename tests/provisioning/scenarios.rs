//! BDD scenarios for the provisioning orchestrator.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisioningContext, provisioning_context};

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Provision a device whose companion packages are present"
)]
fn scenario_packages_present(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Provision a fresh device"
)]
fn scenario_fresh_device(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Mark a device failed when the package manager rejects an install"
)]
fn scenario_install_rejected(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Ignore duplicate attach notifications"
)]
fn scenario_duplicate_attach(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Discard the result of a run whose device detached"
)]
fn scenario_detach_discards(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Provision again after a re-attach during a stale run"
)]
fn scenario_reattach_during_stale_run(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Retry a failed device after it re-attaches"
)]
fn scenario_retry_failed_device(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Provision devices independently"
)]
fn scenario_independent_devices(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Stop when the device watcher fails"
)]
fn scenario_watcher_failure(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Stop when the device watcher stream ends"
)]
fn scenario_watcher_closed(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Shut down before any device attaches"
)]
fn scenario_shutdown_before_attach(provisioning_context: ProvisioningContext) {
    let _ = provisioning_context;
}
