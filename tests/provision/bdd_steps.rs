//! BDD step definitions for provisioning units.

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use verge::{Convergence, FileDeclaration, Fingerprint, ProvisionError, ProvisionOrchestrator};
use verge::test_support::MemoryApiError;

use super::test_helpers::{
    FailureKind, ProvisionContext, ProvisionResult, ProvisionTestError, TARGET_VM,
    seed_running_target, settings,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] ProvisionTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a running VM")]
fn running_vm(mut provision_context: ProvisionContext) -> ProvisionContext {
    seed_running_target(&provision_context.api);
    provision_context.declaration.vm_id = String::from(TARGET_VM);
    provision_context
}

#[given("the VM answers every remote call")]
fn vm_answers(provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.runner.succeed_unscripted();
    provision_context
}

#[given("a unit writing \"{content}\" to \"{destination}\"")]
fn unit_writes_inline(
    mut provision_context: ProvisionContext,
    content: String,
    destination: String,
) -> ProvisionContext {
    provision_context.declaration.files.push(FileDeclaration {
        destination,
        source: None,
        content: Some(content),
    });
    provision_context
}

#[given("a unit with a file setting both source and content")]
fn unit_with_conflicting_file(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.declaration.files.push(FileDeclaration {
        destination: String::from("/etc/motd"),
        source: Some(String::from("motd.txt")),
        content: Some(String::from("welcome")),
    });
    provision_context
}

#[given("the unit runs \"{command}\"")]
fn unit_runs(mut provision_context: ProvisionContext, command: String) -> ProvisionContext {
    provision_context.declaration.commands.push(command);
    provision_context
}

#[given("the unit has trigger \"{key}\" set to \"{value}\"")]
fn unit_trigger(
    mut provision_context: ProvisionContext,
    key: String,
    value: String,
) -> ProvisionContext {
    provision_context.declaration.triggers.insert(key, value);
    provision_context
}

#[given("remote command \"{command}\" prints \"{stdout}\"")]
fn remote_prints(
    provision_context: ProvisionContext,
    command: String,
    stdout: String,
) -> ProvisionContext {
    provision_context
        .runner
        .respond_to(command, 0, format!("{stdout}\n"), "");
    provision_context
}

#[given("remote command \"{command}\" fails with exit code \"{code}\"")]
fn remote_fails(provision_context: ProvisionContext, command: String, code: i32) -> ProvisionContext {
    provision_context
        .runner
        .respond_to(command, code, "", "step failed");
    provision_context
}

#[given("the unit was already applied with the same inputs")]
fn already_applied(mut provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let spec = provision_context
        .declaration
        .validate()
        .map_err(ProvisionTestError::from)?;
    provision_context.previous = Some(Fingerprint::of_provision(&spec));
    Ok(provision_context)
}

#[when("the unit is provisioned")]
fn provision_unit(mut provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let spec = match provision_context.declaration.validate() {
        Ok(spec) => spec,
        Err(err) => {
            provision_context.outcome = Some(ProvisionResult::Failure {
                kind: FailureKind::Config,
                message: err.to_string(),
            });
            return Ok(provision_context);
        }
    };

    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = ProvisionOrchestrator::new(
        &provision_context.api,
        &provision_context.transport.transport,
        settings(),
    );
    let result = runtime.block_on(orchestrator.converge(&spec, provision_context.previous.as_ref()));
    let outcome = match result {
        Ok(Convergence::Applied(report)) => ProvisionResult::Applied(report),
        Ok(Convergence::Unchanged { .. }) => ProvisionResult::Unchanged,
        Err(err) => ProvisionResult::Failure {
            kind: map_failure_kind(&err),
            message: err.to_string(),
        },
    };
    provision_context.outcome = Some(outcome);
    Ok(provision_context)
}

#[then("provisioning succeeds")]
fn provisioning_succeeds(provision_context: &ProvisionContext) -> Result<(), StepError> {
    applied_report(provision_context).map(|_| ())
}

#[then("the output of command \"{position}\" contains \"{text}\"")]
fn command_output_contains(
    provision_context: &ProvisionContext,
    position: usize,
    text: String,
) -> Result<(), StepError> {
    let report = applied_report(provision_context)?;
    let command = report
        .commands
        .iter()
        .find(|command| command.position == position)
        .ok_or_else(|| StepError::Assertion(format!("no report for command {position}")))?;
    if command.stdout.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "command {position} stdout {:?} lacks {text:?}",
            command.stdout
        )))
    }
}

#[then("every file was written before the first command")]
fn files_before_commands(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let remote = provision_context.runner.remote_commands();
    let last_write = remote
        .iter()
        .rposition(|command| command.starts_with("base64 -d > "))
        .ok_or_else(|| StepError::Assertion(String::from("no file was written")))?;
    let first_declared = provision_context
        .declaration
        .commands
        .first()
        .ok_or_else(|| StepError::Assertion(String::from("unit declares no commands")))?;
    let first_command = remote
        .iter()
        .position(|command| command == first_declared)
        .ok_or_else(|| StepError::Assertion(format!("{first_declared} never ran")))?;
    if last_write < first_command {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "file write at {last_write} follows first command at {first_command}: {remote:?}"
        )))
    }
}

#[then("provisioning fails with a configuration error")]
fn fails_with_config_error(provision_context: &ProvisionContext) -> Result<(), StepError> {
    match failure(provision_context)? {
        (FailureKind::Config, _) => Ok(()),
        (kind, message) => Err(StepError::Assertion(format!(
            "expected configuration error, got {kind:?}: {message}"
        ))),
    }
}

#[then("provisioning fails at command \"{position}\"")]
fn fails_at_command(provision_context: &ProvisionContext, position: usize) -> Result<(), StepError> {
    match failure(provision_context)? {
        (FailureKind::Command { position: failed }, _) if *failed == position => Ok(()),
        (kind, message) => Err(StepError::Assertion(format!(
            "expected failure at command {position}, got {kind:?}: {message}"
        ))),
    }
}

#[then("no remote calls were made")]
fn no_remote_calls(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let api_calls = provision_context.api.calls();
    let invocations = provision_context.runner.invocations();
    if api_calls.is_empty() && invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no remote calls, got api {api_calls:?} and {} ssh invocations",
            invocations.len()
        )))
    }
}

#[then("remote command \"{command}\" never ran")]
fn command_never_ran(provision_context: &ProvisionContext, command: String) -> Result<(), StepError> {
    let remote = provision_context.runner.remote_commands();
    if remote.contains(&command) {
        Err(StepError::Assertion(format!("{command} ran: {remote:?}")))
    } else {
        Ok(())
    }
}

#[then("provisioning is reported unchanged")]
fn reported_unchanged(provision_context: &ProvisionContext) -> Result<(), StepError> {
    match &provision_context.outcome {
        Some(ProvisionResult::Unchanged) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected unchanged outcome, got {other:?}"
        ))),
    }
}

#[then("\"{count}\" commands ran")]
fn commands_ran(provision_context: &ProvisionContext, count: usize) -> Result<(), StepError> {
    let report = applied_report(provision_context)?;
    if report.commands.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} commands, got {}",
            report.commands.len()
        )))
    }
}

fn applied_report(
    provision_context: &ProvisionContext,
) -> Result<&verge::ProvisionReport, StepError> {
    match &provision_context.outcome {
        Some(ProvisionResult::Applied(report)) => Ok(report),
        other => Err(StepError::Assertion(format!(
            "expected applied outcome, got {other:?}"
        ))),
    }
}

fn failure(provision_context: &ProvisionContext) -> Result<(&FailureKind, &str), StepError> {
    match &provision_context.outcome {
        Some(ProvisionResult::Failure { kind, message }) => Ok((kind, message.as_str())),
        other => Err(StepError::Assertion(format!(
            "expected failure outcome, got {other:?}"
        ))),
    }
}

const fn map_failure_kind(err: &ProvisionError<MemoryApiError>) -> FailureKind {
    match err {
        ProvisionError::Command { position, .. } => FailureKind::Command {
            position: *position,
        },
        _ => FailureKind::Other,
    }
}
