//! Shared fixtures for provisioning BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use thiserror::Error;
use verge::test_support::{MemoryLifecycleApi, ScratchTransport, ScriptedRunner};
use verge::{
    DeclarationError, Fingerprint, ProvisionDeclaration, ProvisionReport, ProvisionSettings,
    VmId, VmState,
};

pub const TARGET_VM: &str = "vm-target";

#[derive(Clone)]
pub struct ProvisionContext {
    pub api: MemoryLifecycleApi,
    pub runner: ScriptedRunner,
    pub transport: Arc<ScratchTransport<ScriptedRunner>>,
    pub declaration: ProvisionDeclaration,
    pub previous: Option<Fingerprint>,
    pub outcome: Option<ProvisionResult>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Config,
    Command { position: usize },
    Other,
}

#[derive(Clone, Debug)]
pub enum ProvisionResult {
    Applied(ProvisionReport),
    Unchanged,
    Failure { kind: FailureKind, message: String },
}

#[derive(Clone, Debug, Error)]
pub enum ProvisionTestError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
}

pub const fn settings() -> ProvisionSettings {
    ProvisionSettings {
        reachable_timeout: Duration::from_secs(10),
        command_timeout: Duration::from_secs(5),
        output_limit: 200,
    }
}

pub type ProvisionContextResult = Result<ProvisionContext, ProvisionTestError>;

#[fixture]
pub fn provision_context_result() -> ProvisionContextResult {
    build_provision_context()
}

#[fixture]
pub fn provision_context(provision_context_result: ProvisionContextResult) -> ProvisionContext {
    provision_context_result
        .unwrap_or_else(|err| panic!("provision context fixture should initialise: {err}"))
}

fn build_provision_context() -> ProvisionContextResult {
    let runner = ScriptedRunner::new();
    let transport = ScratchTransport::new(runner.clone());
    Ok(ProvisionContext {
        api: MemoryLifecycleApi::new(),
        runner,
        transport: Arc::new(transport),
        declaration: ProvisionDeclaration::default(),
        previous: None,
        outcome: None,
    })
}

pub fn target_vm() -> VmId {
    VmId::new(TARGET_VM)
}

pub fn seed_running_target(api: &MemoryLifecycleApi) {
    api.insert_vm(&target_vm(), VmState::Running);
}
