//! Local record ledger.
//!
//! The ledger remembers what the engine has done so that later runs can
//! decide whether anything needs redoing: the lineage graph, the fingerprint
//! last applied per provisioning unit, and the image captured per commit
//! unit. It is stored as JSON and replaced atomically on save.

use std::collections::BTreeMap;
use std::io::{self, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ImageId, VmId};
use crate::lineage::{LineageGraph, VmRecord};
use crate::provision::Fingerprint;

/// Errors raised while loading or saving the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// File system access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
    /// The ledger could not be parsed or rendered.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Ledger path.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
}

/// Last applied state of a provisioning unit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRecord {
    /// VM the unit was applied to.
    pub vm_id: VmId,
    /// Fingerprint of the applied inputs.
    pub fingerprint: Fingerprint,
}

/// Image captured by a commit unit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Source VM.
    pub vm_id: VmId,
    /// Captured image.
    pub image_id: ImageId,
    /// Digest of the commit inputs.
    pub digest: Fingerprint,
    /// Whether the source VM was left paused.
    pub keep_paused: bool,
}

/// Everything the engine remembers between runs.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// VMs and images with their parent edges.
    #[serde(default)]
    pub graph: LineageGraph,
    /// Provisioning records keyed by unit name.
    #[serde(default)]
    pub provisions: BTreeMap<String, ProvisionRecord>,
    /// Commit records keyed by unit name.
    #[serde(default)]
    pub commits: BTreeMap<String, CommitRecord>,
}

impl Ledger {
    /// Fingerprint previously applied by `unit` to `vm_id`.
    ///
    /// A record for a different VM does not count: retargeting a unit always
    /// re-runs it.
    #[must_use]
    pub fn applied_fingerprint(&self, unit: &str, vm_id: &VmId) -> Option<&Fingerprint> {
        self.provisions
            .get(unit)
            .filter(|record| &record.vm_id == vm_id)
            .map(|record| &record.fingerprint)
    }

    /// Drops a VM and every provisioning record that targets it.
    ///
    /// Commit records stay: the images they name outlive their source.
    pub fn forget_vm(&mut self, vm_id: &VmId) -> Option<VmRecord> {
        self.provisions.retain(|_, record| &record.vm_id != vm_id);
        self.graph.forget_vm(vm_id)
    }
}

/// JSON ledger on the local file system.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileLedgerStore {
    path: Utf8PathBuf,
}

impl FileLedgerStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the ledger, returning an empty one when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load(&self) -> Result<Ledger, LedgerError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(err) => return Err(io_error(parent, &err)),
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(err) => return Err(io_error(&self.path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(Ledger::default());
        }
        serde_json::from_str(&contents).map_err(|err| LedgerError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    /// Writes the ledger through a uniquely named temporary sibling and
    /// renames it into place.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when rendering or any file system step fails.
    pub fn save(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let (parent, file_name) = self.split()?;
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let mut rendered = serde_json::to_string_pretty(ledger).map_err(|err| LedgerError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        rendered.push('\n');

        let mut staging = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|err| io_error(parent, &err))?;
        staging
            .write_all(rendered.as_bytes())
            .and_then(|()| staging.as_file().sync_all())
            .map_err(|err| io_error(parent, &err))?;
        staging
            .persist(&self.path)
            .map(drop)
            .map_err(|err| io_error(&self.path, &err.error))
    }

    fn split(&self) -> Result<(&Utf8Path, &str), LedgerError> {
        let file_name = self.path.file_name().ok_or_else(|| LedgerError::Io {
            path: self.path.clone(),
            message: String::from("ledger path is missing a file name"),
        })?;
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        Ok((parent, file_name))
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
