//! Lineage failures.

use thiserror::Error;

use crate::api::{ImageId, RunState, VmId};

/// Errors raised by mandatory lifecycle calls.
///
/// Advisory steps never produce these; they travel as
/// [`crate::advisory::Advisory`] values instead.
#[derive(Debug, Error)]
pub enum LineageError<ApiError>
where
    ApiError: std::error::Error + 'static,
{
    /// VM creation failed.
    #[error("create vm failed: {source}")]
    Create {
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// The remote commit call failed.
    #[error("commit of {vm_id} failed: {source}")]
    Commit {
        /// Source VM.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Restoring from an image failed.
    #[error("restore from {image_id} failed: {source}")]
    Restore {
        /// Image being restored.
        image_id: ImageId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Branching a VM failed.
    #[error("branch of {vm_id} failed: {source}")]
    Branch {
        /// Source VM.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Deleting a VM failed.
    #[error("delete of {vm_id} failed: {source}")]
    Delete {
        /// Target VM.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Listing VMs failed.
    #[error("listing vms failed: {source}")]
    List {
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Reading a VM's state failed.
    #[error("refresh of {vm_id} failed: {source}")]
    Refresh {
        /// Target VM.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// Pausing or resuming a VM failed.
    #[error("setting {vm_id} to {} failed: {source}", .state.as_str())]
    StateChange {
        /// Target VM.
        vm_id: VmId,
        /// Requested run state.
        state: RunState,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
}
