//! Remote VM-lifecycle API seam.
//!
//! The engine never talks HTTP directly; it drives a [`LifecycleApi`] so the
//! provisioning and lineage flows can be exercised against in-memory doubles.

use std::future::Future;
use std::pin::Pin;

mod http;
mod types;

pub use http::{DEFAULT_BASE_URL, HttpApiError, HttpLifecycleApi};
pub use types::{Credentials, ImageId, RunState, VmId, VmSpec, VmState, VmSummary};

/// Future returned by lifecycle API operations.
pub type ApiFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations the engine consumes from the remote VM-lifecycle service.
pub trait LifecycleApi: Send + Sync {
    /// Implementation specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a fresh root VM and returns its identifier.
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> ApiFuture<'a, VmId, Self::Error>;

    /// Lists every VM visible to the caller.
    fn list_vms(&self) -> ApiFuture<'_, Vec<VmSummary>, Self::Error>;

    /// Looks up a single VM; `None` means the VM no longer exists.
    fn get_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, Option<VmSummary>, Self::Error>;

    /// Deletes a VM.
    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, (), Self::Error>;

    /// Clones a running VM copy-on-write and returns the new identifier.
    fn branch_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, VmId, Self::Error>;

    /// Captures an immutable image of a VM.
    fn commit_vm<'a>(
        &'a self,
        vm_id: &'a VmId,
        keep_paused: bool,
    ) -> ApiFuture<'a, ImageId, Self::Error>;

    /// Creates a new VM from an image.
    fn restore_vm<'a>(&'a self, image_id: &'a ImageId) -> ApiFuture<'a, VmId, Self::Error>;

    /// Pauses or resumes a VM.
    fn set_run_state<'a>(
        &'a self,
        vm_id: &'a VmId,
        state: RunState,
    ) -> ApiFuture<'a, (), Self::Error>;

    /// Fetches credential material for opening an execution session.
    fn fetch_credentials<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> ApiFuture<'a, Credentials, Self::Error>;
}
