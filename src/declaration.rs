//! Declared resources and their validation.
//!
//! Declarations arrive loosely typed from a manifest or the command line.
//! Validation turns them into the typed specs the engine consumes and is the
//! only place configuration errors originate; it never touches the network.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ImageId, VmId, VmSpec};
use crate::provision::{FileSource, FileSpec, ProvisionSpec};

/// Errors raised while validating a declaration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeclarationError {
    /// A file entry sets neither `source` nor `content`.
    #[error("file {position} ({destination}) must set exactly one of source or content; neither is set")]
    MissingFileSource {
        /// One-based file position.
        position: usize,
        /// Declared destination.
        destination: String,
    },
    /// A file entry sets both `source` and `content`.
    #[error("file {position} ({destination}) must set exactly one of source or content; both are set")]
    ConflictingFileSource {
        /// One-based file position.
        position: usize,
        /// Declared destination.
        destination: String,
    },
    /// A file entry has no destination.
    #[error("file {position} has a blank destination")]
    BlankDestination {
        /// One-based file position.
        position: usize,
    },
    /// A required identifier is blank.
    #[error("{field} must not be blank")]
    BlankIdentifier {
        /// Field name.
        field: &'static str,
    },
    /// A sizing value is zero.
    #[error("{field} must be greater than zero")]
    ZeroSize {
        /// Field name.
        field: &'static str,
    },
    /// A trigger argument is not `key=value`.
    #[error("trigger '{value}' must have the form key=value")]
    MalformedTrigger {
        /// Offending argument.
        value: String,
    },
    /// A manifest could not be read or parsed.
    #[error("failed to load manifest {path}: {message}")]
    Manifest {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
}

/// One declared file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileDeclaration {
    /// Absolute remote path.
    pub destination: String,
    /// Local path to read at upload time.
    #[serde(default)]
    pub source: Option<String>,
    /// Inline content.
    #[serde(default)]
    pub content: Option<String>,
}

/// A provisioning unit as declared.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProvisionDeclaration {
    /// Target VM.
    pub vm_id: String,
    /// Files uploaded before any command runs.
    #[serde(default)]
    pub files: Vec<FileDeclaration>,
    /// Commands run in order.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Values whose change forces a re-run.
    #[serde(default)]
    pub triggers: BTreeMap<String, String>,
}

impl ProvisionDeclaration {
    /// Loads a declaration from a TOML manifest.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::Manifest`] when the file cannot be read or
    /// parsed.
    pub fn from_manifest(path: &Utf8Path) -> Result<Self, DeclarationError> {
        let manifest_error = |message: String| DeclarationError::Manifest {
            path: path.to_path_buf(),
            message,
        };
        let bytes = crate::local_fs::read_bytes(path).map_err(|err| manifest_error(err.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|err| manifest_error(err.to_string()))?;
        toml::from_str(&text).map_err(|err| manifest_error(err.to_string()))
    }

    /// Validates the declaration into a [`ProvisionSpec`].
    ///
    /// Empty `source` and `content` strings count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError`] for the first invalid entry.
    pub fn validate(&self) -> Result<ProvisionSpec, DeclarationError> {
        let vm_id = require_identifier("vm_id", &self.vm_id)?;
        let files = self
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| file.validate(index + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProvisionSpec {
            vm_id: VmId::new(vm_id),
            files,
            commands: self.commands.clone(),
            triggers: self.triggers.clone(),
        })
    }
}

impl FileDeclaration {
    fn validate(&self, position: usize) -> Result<FileSpec, DeclarationError> {
        let destination = self.destination.trim();
        if destination.is_empty() {
            return Err(DeclarationError::BlankDestination { position });
        }
        let source = self.source.as_deref().filter(|value| !value.is_empty());
        let content = self.content.as_deref().filter(|value| !value.is_empty());
        let file_source = match (source, content) {
            (Some(path), None) => FileSource::LocalFile(Utf8PathBuf::from(path)),
            (None, Some(text)) => FileSource::Inline(text.as_bytes().to_vec()),
            (None, None) => {
                return Err(DeclarationError::MissingFileSource {
                    position,
                    destination: destination.to_owned(),
                });
            }
            (Some(_), Some(_)) => {
                return Err(DeclarationError::ConflictingFileSource {
                    position,
                    destination: destination.to_owned(),
                });
            }
        };
        Ok(FileSpec {
            destination: destination.to_owned(),
            source: file_source,
        })
    }
}

/// A VM as declared; unset sizes take the defaults of [`VmSpec`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmDeclaration {
    /// Virtual CPU count.
    pub vcpu_count: Option<u32>,
    /// Memory in MiB.
    pub mem_size_mib: Option<u32>,
    /// Disk in MiB.
    pub fs_size_mib: Option<u32>,
    /// Whether to wait for the VM to boot.
    pub wait_boot: Option<bool>,
}

impl VmDeclaration {
    /// Validates the declaration into a [`VmSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::ZeroSize`] when a size is zero.
    pub fn validate(&self) -> Result<VmSpec, DeclarationError> {
        let defaults = VmSpec::default();
        Ok(VmSpec {
            vcpu_count: non_zero("vcpu_count", self.vcpu_count, defaults.vcpu_count)?,
            mem_size_mib: non_zero("mem_size_mib", self.mem_size_mib, defaults.mem_size_mib)?,
            fs_size_mib: non_zero("fs_size_mib", self.fs_size_mib, defaults.fs_size_mib)?,
            wait_boot: self.wait_boot.unwrap_or(defaults.wait_boot),
        })
    }
}

/// A commit unit as declared.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CommitDeclaration {
    /// VM to capture.
    pub vm_id: String,
    /// Leave the source VM paused after capture.
    #[serde(default)]
    pub keep_paused: bool,
    /// Values whose change forces a new commit.
    #[serde(default)]
    pub triggers: BTreeMap<String, String>,
}

impl CommitDeclaration {
    /// Returns the validated source VM.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::BlankIdentifier`] for a blank VM.
    pub fn vm(&self) -> Result<VmId, DeclarationError> {
        require_identifier("vm_id", &self.vm_id).map(VmId::new)
    }
}

/// A restore as declared.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RestoreDeclaration {
    /// Image to restore.
    pub image_id: String,
}

impl RestoreDeclaration {
    /// Returns the validated image.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::BlankIdentifier`] for a blank image.
    pub fn image(&self) -> Result<ImageId, DeclarationError> {
        require_identifier("image_id", &self.image_id).map(ImageId::new)
    }
}

/// A branch as declared.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BranchDeclaration {
    /// Running VM to clone.
    pub source_vm_id: String,
}

impl BranchDeclaration {
    /// Returns the validated source VM.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::BlankIdentifier`] for a blank VM.
    pub fn source(&self) -> Result<VmId, DeclarationError> {
        require_identifier("source_vm_id", &self.source_vm_id).map(VmId::new)
    }
}

/// Parses a `key=value` trigger argument.
///
/// # Errors
///
/// Returns [`DeclarationError::MalformedTrigger`] when there is no `=` or the
/// key is blank.
pub fn parse_trigger(raw: &str) -> Result<(String, String), DeclarationError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(DeclarationError::MalformedTrigger {
            value: raw.to_owned(),
        }),
    }
}

fn require_identifier<'a>(field: &'static str, value: &'a str) -> Result<&'a str, DeclarationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DeclarationError::BlankIdentifier { field });
    }
    Ok(trimmed)
}

fn non_zero(field: &'static str, value: Option<u32>, default: u32) -> Result<u32, DeclarationError> {
    match value {
        Some(0) => Err(DeclarationError::ZeroSize { field }),
        Some(size) => Ok(size),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn file(source: Option<&str>, content: Option<&str>) -> FileDeclaration {
        FileDeclaration {
            destination: String::from("/tmp/a.sh"),
            source: source.map(str::to_owned),
            content: content.map(str::to_owned),
        }
    }

    fn declaration(files: Vec<FileDeclaration>) -> ProvisionDeclaration {
        ProvisionDeclaration {
            vm_id: String::from("vm-1"),
            files,
            commands: vec![String::from("/tmp/a.sh")],
            triggers: BTreeMap::new(),
        }
    }

    #[rstest]
    #[case::neither(None, None)]
    #[case::both_empty(Some(""), Some(""))]
    fn file_without_source_is_rejected(#[case] source: Option<&str>, #[case] content: Option<&str>) {
        let err = declaration(vec![file(source, content)])
            .validate()
            .expect_err("file without source must fail");
        assert_eq!(
            err,
            DeclarationError::MissingFileSource {
                position: 1,
                destination: String::from("/tmp/a.sh"),
            }
        );
    }

    #[test]
    fn file_with_both_sources_is_rejected_by_position() {
        let err = declaration(vec![
            file(None, Some("echo ok")),
            file(Some("./setup.sh"), Some("echo hi")),
        ])
        .validate()
        .expect_err("conflicting file must fail");
        assert!(matches!(
            err,
            DeclarationError::ConflictingFileSource { position: 2, .. }
        ));
        assert!(err.to_string().contains("both are set"));
    }

    #[rstest]
    #[case::local(Some("./setup.sh"), Some(""), FileSource::LocalFile(Utf8PathBuf::from("./setup.sh")))]
    #[case::inline(None, Some("echo hi"), FileSource::Inline(b"echo hi".to_vec()))]
    fn exactly_one_source_validates(
        #[case] source: Option<&str>,
        #[case] content: Option<&str>,
        #[case] expected: FileSource,
    ) {
        let spec = declaration(vec![file(source, content)])
            .validate()
            .unwrap_or_else(|err| panic!("validate: {err}"));
        let sources: Vec<_> = spec.files.into_iter().map(|entry| entry.source).collect();
        assert_eq!(sources, vec![expected]);
    }

    #[test]
    fn blank_vm_is_rejected() {
        let mut decl = declaration(Vec::new());
        decl.vm_id = String::from("  ");
        assert_eq!(
            decl.validate(),
            Err(DeclarationError::BlankIdentifier { field: "vm_id" })
        );
    }

    #[test]
    fn vm_declaration_fills_defaults() {
        let spec = VmDeclaration {
            vcpu_count: Some(4),
            ..VmDeclaration::default()
        }
        .validate()
        .unwrap_or_else(|err| panic!("validate: {err}"));
        assert_eq!(spec.vcpu_count, 4);
        assert_eq!(spec.mem_size_mib, 2048);
        assert_eq!(spec.fs_size_mib, 4096);
        assert!(spec.wait_boot);
    }

    #[test]
    fn vm_declaration_rejects_zero_memory() {
        let decl = VmDeclaration {
            mem_size_mib: Some(0),
            ..VmDeclaration::default()
        };
        assert_eq!(
            decl.validate(),
            Err(DeclarationError::ZeroSize {
                field: "mem_size_mib"
            })
        );
    }

    #[rstest]
    #[case("version=2", Some(("version", "2")))]
    #[case("empty=", Some(("empty", "")))]
    #[case("a=b=c", Some(("a", "b=c")))]
    #[case("novalue", None)]
    #[case("=x", None)]
    fn triggers_parse_key_value_pairs(#[case] raw: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_trigger(raw).ok();
        let expected = expected.map(|(key, value)| (key.to_owned(), value.to_owned()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn manifest_parses_toml() {
        let dir = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = Utf8PathBuf::from_path_buf(dir.path().join("unit.toml"))
            .unwrap_or_else(|path| panic!("non utf8 {}", path.display()));
        std::fs::write(
            &path,
            concat!(
                "vm_id = \"vm-9\"\n",
                "commands = [\"chmod +x /tmp/a.sh\", \"/tmp/a.sh\"]\n",
                "[[files]]\n",
                "destination = \"/tmp/a.sh\"\n",
                "content = \"echo hi\"\n",
                "[triggers]\n",
                "version = \"1\"\n",
            ),
        )
        .unwrap_or_else(|err| panic!("write manifest: {err}"));

        let decl = ProvisionDeclaration::from_manifest(&path)
            .unwrap_or_else(|err| panic!("manifest: {err}"));
        assert_eq!(decl.vm_id, "vm-9");
        assert_eq!(decl.files.len(), 1);
        assert_eq!(decl.commands.len(), 2);
        assert_eq!(decl.triggers.get("version").map(String::as_str), Some("1"));
    }

    #[test]
    fn missing_manifest_is_a_declaration_error() {
        let err = ProvisionDeclaration::from_manifest(Utf8Path::new("/nonexistent/unit.toml"))
            .expect_err("missing manifest must fail");
        assert!(matches!(err, DeclarationError::Manifest { .. }));
    }
}
