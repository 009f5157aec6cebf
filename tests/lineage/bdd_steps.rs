//! BDD step definitions for commit, restore and branch.

use std::collections::BTreeSet;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use verge::{Parent, VmRecord, VmState};

use super::test_helpers::{
    LineageContext, LineageTestError, seed_running_source, source_vm,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Call(#[from] LineageTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

fn commit_source(
    mut lineage_context: LineageContext,
    keep_paused: bool,
) -> Result<LineageContext, StepError> {
    let outcome = runtime()?
        .block_on(lineage_context.coordinator().commit(&source_vm(), keep_paused))
        .map_err(|err| LineageTestError::Call(err.to_string()))?;
    lineage_context.advisories.extend(outcome.advisories);
    lineage_context.images.push(outcome.value);
    Ok(lineage_context)
}

#[given("a running source VM")]
fn running_source(lineage_context: LineageContext) -> LineageContext {
    seed_running_source(&lineage_context.api);
    lineage_context
}

#[given("the VM answers every remote call")]
fn vm_answers(lineage_context: LineageContext) -> LineageContext {
    lineage_context.runner.succeed_unscripted();
    lineage_context
}

#[given("the VM refuses remote calls")]
fn vm_refuses(lineage_context: LineageContext) -> LineageContext {
    lineage_context.runner.fail_unscripted_with(255);
    lineage_context
}

#[given("new VMs boot after \"{polls}\" polls")]
fn boot_after(lineage_context: LineageContext, polls: usize) -> LineageContext {
    lineage_context.api.boot_after_polls(polls);
    lineage_context
}

#[given("new VMs never boot")]
fn never_boot(lineage_context: LineageContext) -> LineageContext {
    lineage_context.api.never_boot();
    lineage_context
}

#[given("the VM is committed keeping it paused")]
fn given_committed_paused(lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    commit_source(lineage_context, true)
}

#[given("the VM is committed")]
fn given_committed(lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    commit_source(lineage_context, false)
}

#[when("the VM is committed keeping it paused")]
fn commit_paused(lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    commit_source(lineage_context, true)
}

#[when("the VM is committed")]
fn commit(lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    commit_source(lineage_context, false)
}

#[when("the image is restored")]
fn restore(mut lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    let image = lineage_context
        .images
        .last()
        .ok_or_else(|| StepError::Assertion(String::from("no image to restore")))?
        .id
        .clone();
    let outcome = runtime()?
        .block_on(lineage_context.coordinator().restore(&image))
        .map_err(|err| LineageTestError::Call(err.to_string()))?;
    lineage_context.advisories.extend(outcome.advisories.iter().cloned());
    lineage_context.restored = Some(outcome);
    Ok(lineage_context)
}

#[when("the VM is branched")]
fn branch(mut lineage_context: LineageContext) -> Result<LineageContext, StepError> {
    let record = runtime()?
        .block_on(lineage_context.coordinator().branch(&source_vm()))
        .map_err(|err| LineageTestError::Call(err.to_string()))?;
    lineage_context.clone = Some(record);
    Ok(lineage_context)
}

#[then("the flush ran before the capture")]
fn flush_before_capture(lineage_context: &LineageContext) -> Result<(), StepError> {
    let flush = lineage_context.journal.position("ssh:sync");
    let capture = lineage_context.journal.position("api:commit");
    match (flush, capture) {
        (Some(flush), Some(capture)) if flush < capture => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected flush before capture, journal: {:?}",
            lineage_context.journal.entries()
        ))),
    }
}

#[then("the image differs from the source VM")]
fn image_differs(lineage_context: &LineageContext) -> Result<(), StepError> {
    let image = lineage_context
        .images
        .last()
        .ok_or_else(|| StepError::Assertion(String::from("no image captured")))?;
    if image.id.as_str() == image.source_vm.as_str() {
        return Err(StepError::Assertion(format!(
            "image id {} reuses the vm id",
            image.id
        )));
    }
    if image.source_vm == source_vm() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "image records source {} instead of {}",
            image.source_vm,
            source_vm()
        )))
    }
}

#[then("the source VM is paused")]
fn source_paused(lineage_context: &LineageContext) -> Result<(), StepError> {
    match lineage_context.api.vm_state(&source_vm()) {
        Some(VmState::Paused) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected paused source, got {other:?}"
        ))),
    }
}

#[then("no advisory was raised")]
fn no_advisory(lineage_context: &LineageContext) -> Result<(), StepError> {
    if lineage_context.advisories.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected advisories: {:?}",
            lineage_context.advisories
        )))
    }
}

#[then("an image was captured")]
fn image_captured(lineage_context: &LineageContext) -> Result<(), StepError> {
    let captured = lineage_context.api.images();
    let recorded = lineage_context
        .images
        .last()
        .ok_or_else(|| StepError::Assertion(String::from("no image recorded")))?;
    if captured.get(&recorded.id) == Some(&source_vm()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "image {} missing from {captured:?}",
            recorded.id
        )))
    }
}

#[then("a \"{step}\" advisory was raised")]
fn advisory_raised(lineage_context: &LineageContext, step: String) -> Result<(), StepError> {
    if lineage_context
        .advisories
        .iter()
        .any(|advisory| advisory.step.to_string() == step)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "no {step} advisory in {:?}",
            lineage_context.advisories
        )))
    }
}

#[then("\"{count}\" distinct images were captured")]
fn distinct_images(lineage_context: &LineageContext, count: usize) -> Result<(), StepError> {
    let distinct: BTreeSet<_> = lineage_context
        .images
        .iter()
        .map(|image| image.id.clone())
        .collect();
    if distinct.len() == count && lineage_context.images.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} distinct images, got {distinct:?}"
        )))
    }
}

fn restored(lineage_context: &LineageContext) -> Result<&VmRecord, StepError> {
    lineage_context
        .restored
        .as_ref()
        .map(|outcome| &outcome.value)
        .ok_or_else(|| StepError::Assertion(String::from("nothing was restored")))
}

#[then("the restored VM is running")]
fn restored_running(lineage_context: &LineageContext) -> Result<(), StepError> {
    let record = restored(lineage_context)?;
    if record.state == VmState::Running {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "restored vm {} is {:?}",
            record.id, record.state
        )))
    }
}

#[then("the restored VM differs from the source VM")]
fn restored_differs(lineage_context: &LineageContext) -> Result<(), StepError> {
    let record = restored(lineage_context)?;
    if record.id == source_vm() {
        Err(StepError::Assertion(String::from(
            "restore reused the source vm id",
        )))
    } else {
        Ok(())
    }
}

#[then("the restored VM records the image as its parent")]
fn restored_parent(lineage_context: &LineageContext) -> Result<(), StepError> {
    let record = restored(lineage_context)?;
    let image = lineage_context
        .images
        .last()
        .ok_or_else(|| StepError::Assertion(String::from("no image captured")))?;
    if record.parent == Parent::RestoredFrom(image.id.clone()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected parent {:?}",
            record.parent
        )))
    }
}

#[then("the restored VM still exists")]
fn restored_exists(lineage_context: &LineageContext) -> Result<(), StepError> {
    let record = restored(lineage_context)?;
    match lineage_context.api.vm_state(&record.id) {
        Some(_) => Ok(()),
        None => Err(StepError::Assertion(format!(
            "restored vm {} was removed",
            record.id
        ))),
    }
}

#[then("the clone records the source VM as its parent")]
fn clone_parent(lineage_context: &LineageContext) -> Result<(), StepError> {
    let record = lineage_context
        .clone
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("nothing was branched")))?;
    if record.parent == Parent::BranchedFrom(source_vm()) && record.id != source_vm() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected clone {record:?}")))
    }
}
