//! Core library for the Verge VM provisioning and snapshot-lineage engine.
//!
//! The crate opens TLS-tunnelled execution sessions to VMs, applies
//! fingerprinted provisioning units, and coordinates commit, restore and
//! branch so that images form an append-only lineage. Remote lifecycle calls
//! go through the [`LifecycleApi`] seam and remote commands through the
//! [`Transport`] seam.

pub mod advisory;
pub mod api;
pub mod config;
pub mod declaration;
pub mod ledger;
pub mod lineage;
mod local_fs;
pub mod probe;
pub mod provision;
pub mod resource;
pub mod test_support;
pub mod transport;

pub use advisory::{Advisory, AdvisoryStep, Outcome};
pub use api::{
    Credentials, HttpApiError, HttpLifecycleApi, ImageId, LifecycleApi, RunState, VmId, VmSpec,
    VmState, VmSummary,
};
pub use config::{APP_NAME, ApiConfig, ConfigError, EngineConfig};
pub use declaration::{
    BranchDeclaration, CommitDeclaration, DeclarationError, FileDeclaration, ProvisionDeclaration,
    RestoreDeclaration, VmDeclaration,
};
pub use ledger::{FileLedgerStore, Ledger, LedgerError};
pub use lineage::{
    ImageRecord, LineageCoordinator, LineageError, LineageGraph, LineageSettings, Parent, VmRecord,
};
pub use probe::{ProbeError, ReadinessProber};
pub use provision::{
    Convergence, FileSource, FileSpec, Fingerprint, ProvisionError, ProvisionOrchestrator,
    ProvisionReport, ProvisionSettings, ProvisionSpec,
};
pub use resource::{CommitResult, DriverSettings, RefreshReport, ResourceDriver, ResourceError};
pub use transport::{
    CommandOutput, ProcessCommandRunner, Session, Transport, TransportConfig, TransportError,
    TunnelTransport,
};
