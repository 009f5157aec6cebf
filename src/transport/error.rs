//! Transport error taxonomy.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::api::VmId;

/// Errors surfaced by the remote execution transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The ephemeral credential store could not be created or written.
    #[error("failed to write credential material for {vm_id}: {message}")]
    CredentialWrite {
        /// VM the session was opened for.
        vm_id: VmId,
        /// Underlying I/O error text.
        message: String,
    },
    /// Credential material could not be erased on close.
    #[error("failed to erase credential material at {path}: {message}")]
    CredentialErase {
        /// Location of the key file.
        path: Utf8PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
    /// The local helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Piping data to or from the helper process failed.
    #[error("i/o failure talking to {program}: {message}")]
    Io {
        /// Program the pipes belonged to.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The command did not finish in time and was killed.
    #[error("command timed out after {after:?}")]
    Timeout {
        /// Bound that elapsed.
        after: Duration,
        /// Standard output captured before the process was killed.
        stdout: String,
        /// Standard error captured before the process was killed.
        stderr: String,
    },
    /// The remote command exited non-zero.
    #[error("command exited with {}: {stderr}", exit_text(.exit_code))]
    CommandFailed {
        /// Exit code, or `None` when terminated by a signal.
        exit_code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Materialising a remote file failed.
    #[error("writing {path} failed during {step} ({}): {stderr}", exit_text(.exit_code))]
    WriteFailed {
        /// Remote destination.
        path: String,
        /// Which remote step failed.
        step: WriteStep,
        /// Remote exit code, if any.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// A local source file could not be read.
    #[error("cannot read local file {path}: {message}")]
    LocalRead {
        /// Local path that failed.
        path: Utf8PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
    /// Remote output could not be decoded.
    #[error("cannot decode content read from {path}: {message}")]
    Decode {
        /// Remote path that was read.
        path: String,
        /// Decoder error text.
        message: String,
    },
    /// The VM never answered a round-trip within the bound.
    #[error("{vm_id} unreachable after {after:?}{}", last_error_suffix(.last_error))]
    Unreachable {
        /// VM that was probed.
        vm_id: VmId,
        /// Bound that elapsed.
        after: Duration,
        /// Last failed attempt, when any attempt completed.
        #[source]
        last_error: Option<Box<TransportError>>,
    },
}

/// Remote steps of a file write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStep {
    /// Creating the parent directory.
    CreateParent,
    /// Decoding the transferred payload into place.
    Transfer,
}

impl std::fmt::Display for WriteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateParent => f.write_str("parent directory creation"),
            Self::Transfer => f.write_str("content transfer"),
        }
    }
}

impl TransportError {
    /// Returns captured stdout and stderr when the error carries any.
    #[must_use]
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::Timeout { stdout, stderr, .. } | Self::CommandFailed { stdout, stderr, .. } => {
                Some((stdout.as_str(), stderr.as_str()))
            }
            _ => None,
        }
    }
}

fn exit_text(code: &Option<i32>) -> String {
    code.map_or_else(|| String::from("no exit status"), |value| format!("status {value}"))
}

fn last_error_suffix(last_error: &Option<Box<TransportError>>) -> String {
    last_error
        .as_ref()
        .map_or_else(String::new, |err| format!(": {err}"))
}
