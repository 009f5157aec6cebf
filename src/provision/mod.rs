//! Provisioning orchestrator.
//!
//! A provisioning unit uploads files and then runs commands against one VM,
//! in declaration order, stopping at the first failure. Re-application is
//! keyed on a [`Fingerprint`] of the unit's inputs: any change re-runs the
//! whole unit from the top, and an unchanged unit touches nothing remote.

mod error;
mod fingerprint;
mod orchestrator;
mod spec;

pub use error::ProvisionError;
pub use fingerprint::Fingerprint;
pub use orchestrator::{
    CommandReport, Convergence, ProvisionOrchestrator, ProvisionReport, ProvisionSettings,
};
pub use spec::{FileSource, FileSpec, ProvisionSpec};
