//! Shared fixtures for lineage BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use thiserror::Error;
use verge::test_support::{Journal, MemoryLifecycleApi, ScratchTransport, ScriptedRunner};
use verge::{
    Advisory, ImageRecord, LineageCoordinator, LineageSettings, Outcome, ReadinessProber,
    TunnelTransport, VmId, VmRecord, VmState,
};

pub const SOURCE_VM: &str = "vm-source";

#[derive(Clone)]
pub struct LineageContext {
    pub api: MemoryLifecycleApi,
    pub runner: ScriptedRunner,
    pub journal: Journal,
    pub transport: Arc<ScratchTransport<ScriptedRunner>>,
    pub images: Vec<ImageRecord>,
    pub advisories: Vec<Advisory>,
    pub restored: Option<Outcome<VmRecord>>,
    pub clone: Option<VmRecord>,
}

impl LineageContext {
    pub fn coordinator(
        &self,
    ) -> LineageCoordinator<'_, MemoryLifecycleApi, TunnelTransport<ScriptedRunner>> {
        LineageCoordinator::new(&self.api, &self.transport.transport, settings())
    }
}

#[derive(Clone, Debug, Error)]
pub enum LineageTestError {
    #[error("lineage call failed: {0}")]
    Call(String),
}

pub type LineageContextResult = Result<LineageContext, LineageTestError>;

const fn settings() -> LineageSettings {
    LineageSettings {
        flush_timeout: Duration::from_secs(2),
        prober: ReadinessProber::new(Duration::from_millis(10), Duration::from_millis(200)),
    }
}

#[fixture]
pub fn lineage_context_result() -> LineageContextResult {
    build_lineage_context()
}

#[fixture]
pub fn lineage_context(lineage_context_result: LineageContextResult) -> LineageContext {
    lineage_context_result
        .unwrap_or_else(|err| panic!("lineage context fixture should initialise: {err}"))
}

fn build_lineage_context() -> LineageContextResult {
    let journal = Journal::new();
    let api = MemoryLifecycleApi::new().with_journal(journal.clone());
    let runner = ScriptedRunner::new().with_journal(journal.clone());
    let transport = ScratchTransport::new(runner.clone());
    Ok(LineageContext {
        api,
        runner,
        journal,
        transport: Arc::new(transport),
        images: Vec::new(),
        advisories: Vec::new(),
        restored: None,
        clone: None,
    })
}

pub fn source_vm() -> VmId {
    VmId::new(SOURCE_VM)
}

pub fn seed_running_source(api: &MemoryLifecycleApi) {
    api.insert_vm(&source_vm(), VmState::Running);
}
