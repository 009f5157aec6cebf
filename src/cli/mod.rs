//! Command-line interface definitions for the `verge` binary.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `verge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "verge",
    about = "Provision VMs and manage their snapshot lineage",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Manage VMs.
    #[command(subcommand)]
    Vm(VmCommand),
    /// Apply a provisioning manifest to a VM.
    #[command(name = "provision", about = "Apply a provisioning manifest to a VM")]
    Provision(ProvisionCommand),
    /// Flush a VM's filesystem and capture an image.
    #[command(name = "commit", about = "Flush a VM's filesystem and capture an image")]
    Commit(CommitCommand),
    /// Create a VM from an image.
    #[command(name = "restore", about = "Create a VM from an image")]
    Restore(ImageArg),
    /// Clone a running VM.
    #[command(name = "branch", about = "Clone a running VM")]
    Branch(VmArg),
    /// Show the recorded lineage of a VM.
    #[command(name = "lineage", about = "Show the recorded lineage of a VM")]
    Lineage(VmArg),
    /// Forget a recorded image; the remote image is kept.
    #[command(name = "forget-image", about = "Forget a recorded image; the remote image is kept")]
    ForgetImage(ImageArg),
    /// Re-read recorded VMs and drop the ones that are gone.
    #[command(name = "refresh", about = "Re-read recorded VMs and drop the ones that are gone")]
    Refresh,
}

/// VM lifecycle subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum VmCommand {
    /// Create a fresh VM.
    Create(CreateCommand),
    /// List remote VMs.
    List,
    /// Delete a VM and forget it.
    Delete(VmArg),
    /// Pause a VM.
    Pause(VmArg),
    /// Resume a paused VM.
    Resume(VmArg),
}

/// Sizing for `verge vm create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Virtual CPU count.
    #[arg(long, value_name = "COUNT")]
    pub(crate) vcpus: Option<u32>,
    /// Memory size in MiB.
    #[arg(long, value_name = "MIB")]
    pub(crate) memory_mib: Option<u32>,
    /// Disk size in MiB.
    #[arg(long, value_name = "MIB")]
    pub(crate) disk_mib: Option<u32>,
    /// Return as soon as the VM exists instead of waiting for it to boot.
    #[arg(long)]
    pub(crate) no_wait: bool,
}

/// Arguments for `verge provision`.
#[derive(Debug, Args)]
pub(crate) struct ProvisionCommand {
    /// TOML manifest describing the unit.
    #[arg(value_name = "MANIFEST")]
    pub(crate) manifest: Utf8PathBuf,
    /// Unit name used to remember the applied fingerprint. Defaults to the
    /// manifest's file stem.
    #[arg(long, value_name = "NAME")]
    pub(crate) unit: Option<String>,
}

/// Arguments for `verge commit`.
#[derive(Debug, Args)]
pub(crate) struct CommitCommand {
    /// VM to capture.
    #[arg(value_name = "VM")]
    pub(crate) vm: String,
    /// Leave the VM paused after capture.
    #[arg(long)]
    pub(crate) keep_paused: bool,
    /// Trigger value whose change forces a new image (repeatable).
    #[arg(long = "trigger", value_name = "KEY=VALUE")]
    pub(crate) triggers: Vec<String>,
    /// Unit name used to skip re-commits while triggers are unchanged.
    #[arg(long, value_name = "NAME")]
    pub(crate) unit: Option<String>,
}

/// A single VM argument.
#[derive(Debug, Args)]
pub(crate) struct VmArg {
    /// VM identifier.
    #[arg(value_name = "VM")]
    pub(crate) vm: String,
}

/// A single image argument.
#[derive(Debug, Args)]
pub(crate) struct ImageArg {
    /// Image identifier.
    #[arg(value_name = "IMAGE")]
    pub(crate) image: String,
}
