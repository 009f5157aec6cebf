//! Provisioning failures.

use thiserror::Error;

use crate::api::VmId;
use crate::transport::TransportError;

/// Errors surfaced while applying a provisioning unit.
///
/// Every variant names the target VM; step failures also name the position
/// of the file or command that failed.
#[derive(Debug, Error)]
pub enum ProvisionError<ApiError>
where
    ApiError: std::error::Error + 'static,
{
    /// The target VM no longer exists remotely.
    #[error("{vm_id} no longer exists; drop local records of it")]
    Gone {
        /// Missing VM.
        vm_id: VmId,
    },
    /// Credential material could not be fetched.
    #[error("failed to fetch credentials for {vm_id}: {source}")]
    Credentials {
        /// Target VM.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
    /// The execution session could not be opened.
    #[error("failed to open session to {vm_id}: {source}")]
    Session {
        /// Target VM.
        vm_id: VmId,
        /// Transport error.
        #[source]
        source: TransportError,
    },
    /// The VM never became reachable.
    #[error("{vm_id} not reachable for provisioning: {source}")]
    Unreachable {
        /// Target VM.
        vm_id: VmId,
        /// Transport error.
        #[source]
        source: TransportError,
    },
    /// A file could not be uploaded.
    #[error("upload of file {position} ({destination}) to {vm_id} failed: {source}")]
    Upload {
        /// Target VM.
        vm_id: VmId,
        /// One-based file position.
        position: usize,
        /// Remote destination.
        destination: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },
    /// A command failed; later commands were not run.
    #[error("command {position} of {total} on {vm_id} failed ({command}): {source}{output}")]
    Command {
        /// Target VM.
        vm_id: VmId,
        /// One-based command position.
        position: usize,
        /// Number of commands in the unit.
        total: usize,
        /// Command text, truncated.
        command: String,
        /// Captured output, truncated, prefixed with a newline when present.
        output: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },
    /// Provisioning succeeded but credential material was not erased.
    #[error("failed to close session to {vm_id}: {source}")]
    Cleanup {
        /// Target VM.
        vm_id: VmId,
        /// Transport error.
        #[source]
        source: TransportError,
    },
}

impl<ApiError> ProvisionError<ApiError>
where
    ApiError: std::error::Error + 'static,
{
    /// Returns `true` when the failure means the VM is gone.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// One-based position of the failed command, if a command failed.
    #[must_use]
    pub const fn failed_command(&self) -> Option<usize> {
        match self {
            Self::Command { position, .. } => Some(*position),
            _ => None,
        }
    }
}
