//! Remote execution transport.
//!
//! All remote interaction funnels through [`Transport`]: provisioning and the
//! pre-commit flush share its timeout and failure semantics. The only
//! implementation today is [`TunnelTransport`], which spawns `ssh` with a TLS
//! proxy command; a native implementation can slot in behind the same trait.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;

mod config;
mod credential;
mod error;
mod runner;
mod session;
mod tunnel;

pub use config::TransportConfig;
pub use credential::CredentialFile;
pub use error::{TransportError, WriteStep};
pub use runner::{
    CommandInvocation, CommandOutput, CommandRunner, ProcessCommandRunner, RunnerFuture,
};
pub use session::Session;
pub use tunnel::TunnelTransport;

use crate::api::{Credentials, VmId};
use crate::local_fs;

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Authenticated, encrypted command channel to a single VM.
pub trait Transport: Send + Sync {
    /// Derives the VM's address and persists credential material for a new
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CredentialWrite`] when the ephemeral store
    /// cannot be created.
    fn open(&self, vm_id: &VmId, credentials: &Credentials) -> Result<Session, TransportError>;

    /// Runs one command, failing with [`TransportError::CommandFailed`] on a
    /// non-zero exit and [`TransportError::Timeout`] once `timeout` elapses.
    fn run<'a>(
        &'a self,
        session: &'a Session,
        command: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput>;

    /// Materialises `content` byte-for-byte at `destination`, creating the
    /// parent directory first.
    fn write_file<'a>(
        &'a self,
        session: &'a Session,
        destination: &'a str,
        content: &'a [u8],
    ) -> TransportFuture<'a, ()>;

    /// Reads a remote file back as raw bytes.
    fn read_file<'a>(&'a self, session: &'a Session, path: &'a str) -> TransportFuture<'a, Vec<u8>>;

    /// Retries a trivial round-trip until it succeeds or `timeout` elapses.
    fn wait_reachable<'a>(
        &'a self,
        session: &'a Session,
        timeout: Duration,
    ) -> TransportFuture<'a, ()>;

    /// Reads a local file and writes it to `destination`.
    fn upload_file<'a>(
        &'a self,
        session: &'a Session,
        local_path: &'a Utf8Path,
        destination: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let content =
                local_fs::read_bytes(local_path).map_err(|err| TransportError::LocalRead {
                    path: local_path.to_path_buf(),
                    message: err.to_string(),
                })?;
            self.write_file(session, destination, &content).await
        })
    }

    /// Ends the session, erasing its credential material.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CredentialErase`] when erasing fails.
    fn close(&self, session: Session) -> Result<(), TransportError> {
        session.close()
    }
}
