//! BDD scenarios for provisioning units.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContextResult, provision_context_result};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Provision an inline script and read its output"
)]
fn scenario_inline_script(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Reject a file that sets both source and content"
)]
fn scenario_conflicting_file(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Stop at the first failing command"
)]
fn scenario_stop_at_failure(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Skip a unit whose fingerprint is unchanged"
)]
fn scenario_unchanged(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Re-run the whole unit when a trigger changes"
)]
fn scenario_trigger_change(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}
