//! Deterministic fingerprints for change detection.
//!
//! Every field is framed as `tag:length:` followed by its bytes, so adjacent
//! values can never run together and produce the same digest. Triggers are
//! hashed in key order, which makes declaration order irrelevant.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::spec::{FileSource, ProvisionSpec};
use crate::api::VmId;
use crate::local_fs;

const FINGERPRINT_BYTES: usize = 8;

/// Short hex digest identifying one provisioning or commit input set.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a provisioning spec.
    ///
    /// Local sources are hashed by content when readable and by path
    /// otherwise, so editing a source file changes the fingerprint.
    #[must_use]
    pub fn of_provision(spec: &ProvisionSpec) -> Self {
        let mut hasher = FieldHasher::default();
        hasher.field("vm", spec.vm_id.as_bytes());
        hasher.count("files", spec.files.len());
        for file in &spec.files {
            hasher.field("destination", file.destination.as_bytes());
            match &file.source {
                FileSource::Inline(bytes) => hasher.field("content", bytes),
                FileSource::LocalFile(path) => match local_fs::read_bytes(path) {
                    Ok(bytes) => hasher.field("content", &bytes),
                    Err(_) => hasher.field("source", path.as_str().as_bytes()),
                },
            }
        }
        hasher.count("commands", spec.commands.len());
        for command in &spec.commands {
            hasher.field("command", command.as_bytes());
        }
        hasher.triggers(&spec.triggers);
        hasher.finish()
    }

    /// Computes the fingerprint of a commit declaration.
    #[must_use]
    pub fn of_commit(vm_id: &VmId, keep_paused: bool, triggers: &BTreeMap<String, String>) -> Self {
        let mut hasher = FieldHasher::default();
        hasher.field("vm", vm_id.as_bytes());
        let flag = if keep_paused { "true" } else { "false" };
        hasher.field("keep_paused", flag.as_bytes());
        hasher.triggers(triggers);
        hasher.finish()
    }

    /// Wraps a previously recorded fingerprint.
    #[must_use]
    pub fn from_recorded(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the hex digest.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct FieldHasher(Sha256);

impl FieldHasher {
    fn field(&mut self, tag: &str, bytes: &[u8]) {
        self.0.update(format!("{tag}:{}:", bytes.len()).as_bytes());
        self.0.update(bytes);
    }

    fn count(&mut self, tag: &str, value: usize) {
        self.field(tag, value.to_string().as_bytes());
    }

    fn triggers(&mut self, triggers: &BTreeMap<String, String>) {
        self.count("triggers", triggers.len());
        for (key, value) in triggers {
            self.field("trigger_key", key.as_bytes());
            self.field("trigger_value", value.as_bytes());
        }
    }

    fn finish(self) -> Fingerprint {
        let digest = self.0.finalize();
        Fingerprint(
            digest
                .iter()
                .take(FINGERPRINT_BYTES)
                .map(|byte| format!("{byte:02x}"))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::FileSpec;
    use rstest::{fixture, rstest};

    #[fixture]
    fn base() -> ProvisionSpec {
        ProvisionSpec::new(VmId::from("vm-1"))
            .with_inline_file("/tmp/a.sh", "echo hi")
            .with_command("chmod +x /tmp/a.sh")
            .with_command("/tmp/a.sh")
            .with_trigger("version", "1")
            .with_trigger("channel", "stable")
    }

    #[rstest]
    fn identical_specs_share_a_fingerprint(base: ProvisionSpec) {
        assert_eq!(
            Fingerprint::of_provision(&base),
            Fingerprint::of_provision(&base.clone())
        );
    }

    #[rstest]
    fn trigger_insertion_order_is_irrelevant(base: ProvisionSpec) {
        let reordered = ProvisionSpec::new(VmId::from("vm-1"))
            .with_inline_file("/tmp/a.sh", "echo hi")
            .with_command("chmod +x /tmp/a.sh")
            .with_command("/tmp/a.sh")
            .with_trigger("channel", "stable")
            .with_trigger("version", "1");
        assert_eq!(
            Fingerprint::of_provision(&base),
            Fingerprint::of_provision(&reordered)
        );
    }

    #[rstest]
    #[case::file_content(|spec: &mut ProvisionSpec| {
        spec.files = vec![FileSpec {
            destination: String::from("/tmp/a.sh"),
            source: FileSource::Inline(b"echo bye".to_vec()),
        }];
    })]
    #[case::destination(|spec: &mut ProvisionSpec| {
        spec.files = vec![FileSpec {
            destination: String::from("/tmp/b.sh"),
            source: FileSource::Inline(b"echo hi".to_vec()),
        }];
    })]
    #[case::command(|spec: &mut ProvisionSpec| {
        spec.commands = vec![String::from("chmod +x /tmp/a.sh"), String::from("/tmp/a.sh -v")];
    })]
    #[case::trigger_value(|spec: &mut ProvisionSpec| {
        spec.triggers.insert(String::from("version"), String::from("2"));
    })]
    #[case::vm(|spec: &mut ProvisionSpec| {
        spec.vm_id = VmId::from("vm-2");
    })]
    fn any_single_change_alters_fingerprint(
        base: ProvisionSpec,
        #[case] mutate: fn(&mut ProvisionSpec),
    ) {
        let mut changed = base.clone();
        mutate(&mut changed);
        assert_ne!(
            Fingerprint::of_provision(&base),
            Fingerprint::of_provision(&changed)
        );
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let split_one = ProvisionSpec::new(VmId::from("vm"))
            .with_command("ab")
            .with_command("c");
        let split_two = ProvisionSpec::new(VmId::from("vm"))
            .with_command("a")
            .with_command("bc");
        assert_ne!(
            Fingerprint::of_provision(&split_one),
            Fingerprint::of_provision(&split_two)
        );
    }

    #[test]
    fn local_source_is_hashed_by_content() {
        let dir = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("setup.sh"))
            .unwrap_or_else(|path| panic!("non utf8 {}", path.display()));
        std::fs::write(&path, "v1").unwrap_or_else(|err| panic!("write: {err}"));
        let spec = ProvisionSpec::new(VmId::from("vm")).with_local_file("/opt/setup.sh", path.clone());
        let before = Fingerprint::of_provision(&spec);

        std::fs::write(&path, "v2").unwrap_or_else(|err| panic!("write: {err}"));

        assert_ne!(before, Fingerprint::of_provision(&spec));
    }

    #[test]
    fn fingerprint_is_sixteen_hex_characters() {
        let fingerprint = Fingerprint::of_provision(&ProvisionSpec::new(VmId::from("vm")));
        assert_eq!(fingerprint.as_str().len(), 16);
        assert!(fingerprint.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn commit_digest_tracks_keep_paused_and_triggers() {
        let vm = VmId::from("vm-1");
        let mut triggers = BTreeMap::new();
        triggers.insert(String::from("layer"), String::from("base"));
        let paused = Fingerprint::of_commit(&vm, true, &triggers);
        assert_ne!(paused, Fingerprint::of_commit(&vm, false, &triggers));
        triggers.insert(String::from("layer"), String::from("tools"));
        assert_ne!(paused, Fingerprint::of_commit(&vm, true, &triggers));
    }
}
