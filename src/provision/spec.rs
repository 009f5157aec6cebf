//! Validated provisioning inputs.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::api::VmId;

/// Where a file's bytes come from.
///
/// Exactly one source exists per file; declarations that name both or
/// neither are rejected before a spec is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileSource {
    /// Read from the local filesystem at upload time.
    LocalFile(Utf8PathBuf),
    /// Supplied inline.
    Inline(Vec<u8>),
}

/// One file to materialise on the VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileSpec {
    /// Absolute remote destination path.
    pub destination: String,
    /// Content source.
    pub source: FileSource,
}

/// Everything one provisioning unit applies to a VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionSpec {
    /// Target VM.
    pub vm_id: VmId,
    /// Files uploaded in order before any command runs.
    pub files: Vec<FileSpec>,
    /// Shell commands run in order.
    pub commands: Vec<String>,
    /// Caller-supplied values whose change forces a re-run.
    pub triggers: BTreeMap<String, String>,
}

impl ProvisionSpec {
    /// Starts an empty spec for `vm_id`.
    #[must_use]
    pub const fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            files: Vec::new(),
            commands: Vec::new(),
            triggers: BTreeMap::new(),
        }
    }

    /// Appends an inline file.
    #[must_use]
    pub fn with_inline_file(mut self, destination: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(FileSpec {
            destination: destination.into(),
            source: FileSource::Inline(content.into()),
        });
        self
    }

    /// Appends a file read from the local filesystem.
    #[must_use]
    pub fn with_local_file(mut self, destination: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.push(FileSpec {
            destination: destination.into(),
            source: FileSource::LocalFile(path.into()),
        });
        self
    }

    /// Appends a command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Sets a trigger value.
    #[must_use]
    pub fn with_trigger(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.triggers.insert(key.into(), value.into());
        self
    }
}
