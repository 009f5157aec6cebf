//! Session-owned credential material.
//!
//! Each session gets its own private directory holding one key file. The
//! directory is removed and the key overwritten when the session closes, and
//! again from `Drop` if a caller forgets.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tempfile::TempDir;
use tracing::warn;

use super::error::TransportError;
use crate::api::VmId;

const KEY_FILE_NAME: &str = "id_key";
const DIR_MODE: u32 = 0o700;
const KEY_MODE: u32 = 0o600;

/// Private key persisted for the lifetime of one execution session.
#[derive(Debug)]
pub struct CredentialFile {
    dir: Option<TempDir>,
    key_path: Utf8PathBuf,
}

impl CredentialFile {
    /// Writes `private_key` into a fresh access-restricted directory.
    ///
    /// `root` selects where the directory is created; the system temporary
    /// directory is used when it is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CredentialWrite`] when the directory or key
    /// file cannot be created.
    pub fn create(
        vm_id: &VmId,
        private_key: &str,
        root: Option<&Utf8Path>,
    ) -> Result<Self, TransportError> {
        let write_error = |message: String| TransportError::CredentialWrite {
            vm_id: vm_id.clone(),
            message,
        };

        let prefix = format!("verge-{}-", sanitise(vm_id.as_str()));
        let mut builder = tempfile::Builder::new();
        builder
            .prefix(&prefix)
            .permissions(Permissions::from_mode(DIR_MODE));
        let dir = match root {
            Some(path) => builder.tempdir_in(path),
            None => builder.tempdir(),
        }
        .map_err(|err| write_error(err.to_string()))?;

        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|path| write_error(format!("non UTF-8 path {}", path.display())))?;
        let handle = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .map_err(|err| write_error(err.to_string()))?;

        handle
            .write(KEY_FILE_NAME, b"")
            .and_then(|()| {
                handle.set_permissions(
                    KEY_FILE_NAME,
                    cap_std::fs::Permissions::from_std(Permissions::from_mode(KEY_MODE)),
                )
            })
            .and_then(|()| handle.write(KEY_FILE_NAME, normalise_key(private_key)))
            .map_err(|err| write_error(err.to_string()))?;

        Ok(Self {
            dir: Some(dir),
            key_path: dir_path.join(KEY_FILE_NAME),
        })
    }

    /// Location of the key file, valid until [`CredentialFile::erase`].
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.key_path
    }

    /// Overwrites the key with zeros and removes its directory.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CredentialErase`] when the key cannot be
    /// scrubbed or the directory cannot be removed.
    pub fn erase(&mut self) -> Result<(), TransportError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        let erase_error = |message: String| TransportError::CredentialErase {
            path: self.key_path.clone(),
            message,
        };

        let scrubbed = scrub(dir.path());
        let removed = dir.close().map_err(|err| erase_error(err.to_string()));
        scrubbed.map_err(|err| erase_error(err.to_string()))?;
        removed
    }

    /// Returns `true` once the material has been erased.
    #[must_use]
    pub const fn is_erased(&self) -> bool {
        self.dir.is_none()
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        if let Err(err) = self.erase() {
            warn!(error = %err, "credential material not fully erased");
        }
    }
}

fn scrub(dir: &std::path::Path) -> std::io::Result<()> {
    let handle = cap_std::fs::Dir::open_ambient_dir(dir, ambient_authority())?;
    let length = handle.metadata(KEY_FILE_NAME)?.len();
    let zeros = vec![0_u8; usize::try_from(length).unwrap_or(0)];
    handle.write(KEY_FILE_NAME, zeros)?;
    handle.remove_file(KEY_FILE_NAME)
}

fn normalise_key(key: &str) -> Vec<u8> {
    let mut bytes = key.as_bytes().to_vec();
    if !key.ends_with('\n') {
        bytes.push(b'\n');
    }
    bytes
}

fn sanitise(value: &str) -> String {
    value
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .take(32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn root() -> TempDir {
        TempDir::new().unwrap_or_else(|err| panic!("temp root: {err}"))
    }

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non utf8 temp path {}", path.display()))
    }

    #[rstest]
    fn key_file_is_private_and_newline_terminated(root: TempDir) {
        let base = utf8(&root);
        let credential = CredentialFile::create(&VmId::from("vm-1"), "KEY", Some(&base))
            .unwrap_or_else(|err| panic!("create credential: {err}"));

        let metadata = std::fs::metadata(credential.path())
            .unwrap_or_else(|err| panic!("stat key: {err}"));
        assert_eq!(metadata.permissions().mode() & 0o777, KEY_MODE);
        let dir_mode = std::fs::metadata(
            credential
                .path()
                .parent()
                .unwrap_or_else(|| panic!("key has a parent")),
        )
        .unwrap_or_else(|err| panic!("stat dir: {err}"))
        .permissions()
        .mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
        let content = std::fs::read_to_string(credential.path())
            .unwrap_or_else(|err| panic!("read key: {err}"));
        assert_eq!(content, "KEY\n");
    }

    #[rstest]
    fn erase_removes_material(root: TempDir) {
        let base = utf8(&root);
        let mut credential = CredentialFile::create(&VmId::from("vm-1"), "KEY\n", Some(&base))
            .unwrap_or_else(|err| panic!("create credential: {err}"));
        let path = credential.path().to_path_buf();

        credential
            .erase()
            .unwrap_or_else(|err| panic!("erase: {err}"));

        assert!(credential.is_erased());
        assert!(!path.exists());
        assert!(credential.erase().is_ok(), "second erase is a no-op");
    }

    #[rstest]
    fn drop_erases_material(root: TempDir) {
        let base = utf8(&root);
        let credential = CredentialFile::create(&VmId::from("vm-1"), "KEY", Some(&base))
            .unwrap_or_else(|err| panic!("create credential: {err}"));
        let path = credential.path().to_path_buf();
        drop(credential);
        assert!(!path.exists());
    }

    #[rstest]
    fn concurrent_sessions_for_one_vm_do_not_share_paths(root: TempDir) {
        let base = utf8(&root);
        let vm = VmId::from("vm-shared");
        let first = CredentialFile::create(&vm, "A", Some(&base))
            .unwrap_or_else(|err| panic!("create first: {err}"));
        let second = CredentialFile::create(&vm, "B", Some(&base))
            .unwrap_or_else(|err| panic!("create second: {err}"));
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn missing_root_reports_credential_write_error() {
        let missing = Utf8PathBuf::from("/nonexistent/verge/credentials");
        let result = CredentialFile::create(&VmId::from("vm-1"), "KEY", Some(&missing));
        assert!(
            matches!(result, Err(TransportError::CredentialWrite { .. })),
            "unexpected result: {result:?}"
        );
    }
}
