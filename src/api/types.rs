//! Identifiers and wire types shared by every lifecycle API implementation.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier issued by the remote system.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier!(
    /// Opaque VM identifier assigned by the remote system.
    VmId
);
identifier!(
    /// Opaque image (commit) identifier assigned by the remote system.
    ImageId
);

/// Lifecycle state reported for a VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VmState {
    /// The VM exists but has not finished booting.
    Booting,
    /// The VM is running and can accept work.
    Running,
    /// The VM is paused; its memory and disk are frozen.
    Paused,
    /// The VM has been deleted.
    Deleted,
    /// A state this client does not recognise.
    Unknown(String),
}

impl VmState {
    /// Returns the wire representation of the state.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
            Self::Unknown(raw) => raw.as_str(),
        }
    }
}

impl From<String> for VmState {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "booting" | "starting" => Self::Booting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "deleted" => Self::Deleted,
            _ => Self::Unknown(value),
        }
    }
}

impl From<VmState> for String {
    fn from(value: VmState) -> Self {
        match value {
            VmState::Unknown(raw) => raw,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state a caller may request for an existing VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Freeze the VM in place.
    Paused,
    /// Resume a paused VM.
    Running,
}

impl RunState {
    /// Returns the wire representation of the run state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Running => "running",
        }
    }
}

/// One VM as reported by the inventory listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    /// VM identifier.
    #[serde(rename = "vm_id")]
    pub id: VmId,
    /// Current lifecycle state.
    pub state: VmState,
    /// Creation timestamp as reported by the remote system.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Owner identifier when the remote system reports one.
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Sizing and boot parameters for a fresh VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
    /// Root filesystem size in MiB.
    pub fs_size_mib: u32,
    /// Whether creation should wait until the VM reports `running`.
    pub wait_boot: bool,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            mem_size_mib: 2048,
            fs_size_mib: 4096,
            wait_boot: true,
        }
    }
}

/// Per-VM credential material used to open an execution session.
#[derive(Clone, Eq, PartialEq, Deserialize)]
pub struct Credentials {
    /// SSH port advertised by the remote system.
    #[serde(rename = "ssh_port", default)]
    pub port: Option<u16>,
    /// PEM-encoded private key.
    #[serde(rename = "ssh_private_key")]
    pub private_key: String,
}

impl Credentials {
    /// Builds credential material from a private key.
    #[must_use]
    pub fn new(private_key: impl Into<String>) -> Self {
        Self {
            port: None,
            private_key: private_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("port", &self.port)
            .field("private_key", &"<redacted>")
            .finish()
    }
}
