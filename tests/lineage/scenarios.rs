//! BDD scenarios for commit, restore and branch.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LineageContextResult, lineage_context_result};

#[scenario(
    path = "tests/features/lineage.feature",
    name = "Flush the filesystem before capturing an image"
)]
fn scenario_flush_before_capture(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}

#[scenario(
    path = "tests/features/lineage.feature",
    name = "Commit an unreachable VM with an advisory"
)]
fn scenario_unreachable_commit(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}

#[scenario(
    path = "tests/features/lineage.feature",
    name = "Commit twice to get two images"
)]
fn scenario_two_commits(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}

#[scenario(
    path = "tests/features/lineage.feature",
    name = "Restore an image into a new running VM"
)]
fn scenario_restore(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}

#[scenario(
    path = "tests/features/lineage.feature",
    name = "Downgrade a slow boot to an advisory"
)]
fn scenario_slow_boot(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}

#[scenario(path = "tests/features/lineage.feature", name = "Branch a running VM")]
fn scenario_branch(lineage_context_result: LineageContextResult) {
    drop(lineage_context_result);
}
