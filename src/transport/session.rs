//! Execution session handle.

use camino::Utf8Path;

use super::credential::CredentialFile;
use super::error::TransportError;
use crate::api::VmId;

/// Transient, VM-scoped channel state: derived host plus owned credential.
///
/// Dropping a session erases its credential material; [`Session::close`]
/// does the same while surfacing erase failures.
#[derive(Debug)]
pub struct Session {
    vm_id: VmId,
    host: String,
    credential: CredentialFile,
}

impl Session {
    /// Assembles a session from its parts.
    #[must_use]
    pub const fn new(vm_id: VmId, host: String, credential: CredentialFile) -> Self {
        Self {
            vm_id,
            host,
            credential,
        }
    }

    /// VM this session targets.
    #[must_use]
    pub const fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    /// Network host derived from the VM identifier.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path of the session's private key.
    #[must_use]
    pub fn key_path(&self) -> &Utf8Path {
        self.credential.path()
    }

    /// Erases credential material and ends the session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CredentialErase`] when the key cannot be
    /// removed.
    pub fn close(mut self) -> Result<(), TransportError> {
        self.credential.erase()
    }
}
