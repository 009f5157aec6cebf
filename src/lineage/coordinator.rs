//! Commit, restore and branch against the lifecycle API.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::LineageError;
use super::graph::{ImageRecord, Parent, VmRecord};
use crate::advisory::{Advisory, AdvisoryStep, Outcome};
use crate::api::{ImageId, LifecycleApi, RunState, VmId, VmSpec, VmState, VmSummary};
use crate::config::EngineConfig;
use crate::probe::ReadinessProber;
use crate::transport::Transport;

/// Command run on the guest to flush dirty pages before capture.
pub const FLUSH_COMMAND: &str = "sync";

/// Bounds for the advisory steps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineageSettings {
    /// Bound on the pre-commit flush.
    pub flush_timeout: Duration,
    /// Boot poller used after create and restore.
    pub prober: ReadinessProber,
}

impl Default for LineageSettings {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(120),
            prober: ReadinessProber::default(),
        }
    }
}

impl LineageSettings {
    /// Derives settings from engine configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            flush_timeout: config.flush_timeout(),
            prober: ReadinessProber::new(config.boot_poll_interval(), config.boot_timeout()),
        }
    }
}

/// Freezes VMs into images and materialises VMs from images or live VMs.
///
/// The coordinator returns lineage records but does not store them; callers
/// decide where the graph lives.
#[derive(Debug)]
pub struct LineageCoordinator<'a, A, T> {
    api: &'a A,
    transport: &'a T,
    settings: LineageSettings,
}

impl<'a, A, T> LineageCoordinator<'a, A, T>
where
    A: LifecycleApi,
    T: Transport,
{
    /// Creates a coordinator over the given collaborators.
    #[must_use]
    pub const fn new(api: &'a A, transport: &'a T, settings: LineageSettings) -> Self {
        Self {
            api,
            transport,
            settings,
        }
    }

    /// Creates a fresh VM, waiting for it to boot when `spec.wait_boot` is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Create`] when the create call fails. A boot
    /// timeout is reported as an advisory.
    pub async fn create(&self, spec: &VmSpec) -> Result<Outcome<VmRecord>, LineageError<A::Error>> {
        let vm_id = self
            .api
            .create_vm(spec)
            .await
            .map_err(|source| LineageError::Create { source })?;
        info!(vm_id = %vm_id, vcpus = spec.vcpu_count, "vm created");
        if !spec.wait_boot {
            return Ok(Outcome::clean(VmRecord {
                id: vm_id,
                parent: Parent::Fresh,
                state: VmState::Booting,
            }));
        }
        Ok(self.await_boot(vm_id, Parent::Fresh).await)
    }

    /// Flushes the guest filesystem, then captures an image.
    ///
    /// The flush is advisory: when credentials, the session or the command
    /// fail, the capture still happens and the failure is returned as a
    /// [`AdvisoryStep::PreCommitFlush`] advisory. Each call yields a new
    /// image.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Commit`] when the capture call fails.
    pub async fn commit(
        &self,
        vm_id: &VmId,
        keep_paused: bool,
    ) -> Result<Outcome<ImageRecord>, LineageError<A::Error>> {
        let advisories: Vec<Advisory> = self.flush(vm_id).await.into_iter().collect();
        let image_id = self
            .api
            .commit_vm(vm_id, keep_paused)
            .await
            .map_err(|source| LineageError::Commit {
                vm_id: vm_id.clone(),
                source,
            })?;
        info!(vm_id = %vm_id, image_id = %image_id, keep_paused, "vm committed");
        Ok(Outcome::with_advisories(
            ImageRecord {
                id: image_id,
                source_vm: vm_id.clone(),
                keep_paused,
            },
            advisories,
        ))
    }

    /// Creates a VM from an image and waits for it to boot.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Restore`] when the restore call fails. A boot
    /// timeout is reported as an advisory.
    pub async fn restore(
        &self,
        image_id: &ImageId,
    ) -> Result<Outcome<VmRecord>, LineageError<A::Error>> {
        let vm_id = self
            .api
            .restore_vm(image_id)
            .await
            .map_err(|source| LineageError::Restore {
                image_id: image_id.clone(),
                source,
            })?;
        info!(vm_id = %vm_id, image_id = %image_id, "vm restored");
        Ok(self
            .await_boot(vm_id, Parent::RestoredFrom(image_id.clone()))
            .await)
    }

    /// Clones a running VM.
    ///
    /// The clone is not polled; its state is whatever the first lookup
    /// reports, or `booting` if the lookup fails.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Branch`] when the branch call fails.
    pub async fn branch(&self, source_vm: &VmId) -> Result<VmRecord, LineageError<A::Error>> {
        let vm_id = self
            .api
            .branch_vm(source_vm)
            .await
            .map_err(|source| LineageError::Branch {
                vm_id: source_vm.clone(),
                source,
            })?;
        let state = match self.api.get_vm(&vm_id).await {
            Ok(Some(summary)) => summary.state,
            Ok(None) => VmState::Booting,
            Err(err) => {
                debug!(vm_id = %vm_id, error = %err, "state lookup after branch failed");
                VmState::Booting
            }
        };
        info!(vm_id = %vm_id, source_vm = %source_vm, "vm branched");
        Ok(VmRecord {
            id: vm_id,
            parent: Parent::BranchedFrom(source_vm.clone()),
            state,
        })
    }

    /// Deletes a VM remotely.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Delete`] when the delete call fails.
    pub async fn delete(&self, vm_id: &VmId) -> Result<(), LineageError<A::Error>> {
        self.api
            .delete_vm(vm_id)
            .await
            .map_err(|source| LineageError::Delete {
                vm_id: vm_id.clone(),
                source,
            })?;
        info!(vm_id = %vm_id, "vm deleted");
        Ok(())
    }

    /// Looks up a VM; `None` means it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Refresh`] when the lookup fails.
    pub async fn refresh(&self, vm_id: &VmId) -> Result<Option<VmSummary>, LineageError<A::Error>> {
        self.api
            .get_vm(vm_id)
            .await
            .map_err(|source| LineageError::Refresh {
                vm_id: vm_id.clone(),
                source,
            })
    }

    /// Lists the remote inventory.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::List`] when the listing fails.
    pub async fn list(&self) -> Result<Vec<VmSummary>, LineageError<A::Error>> {
        self.api
            .list_vms()
            .await
            .map_err(|source| LineageError::List { source })
    }

    /// Pauses a VM.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::StateChange`] when the call fails.
    pub async fn pause(&self, vm_id: &VmId) -> Result<(), LineageError<A::Error>> {
        self.set_run_state(vm_id, RunState::Paused).await
    }

    /// Resumes a paused VM.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::StateChange`] when the call fails.
    pub async fn resume(&self, vm_id: &VmId) -> Result<(), LineageError<A::Error>> {
        self.set_run_state(vm_id, RunState::Running).await
    }

    async fn set_run_state(
        &self,
        vm_id: &VmId,
        state: RunState,
    ) -> Result<(), LineageError<A::Error>> {
        self.api
            .set_run_state(vm_id, state)
            .await
            .map_err(|source| LineageError::StateChange {
                vm_id: vm_id.clone(),
                state,
                source,
            })?;
        info!(vm_id = %vm_id, state = state.as_str(), "vm run state changed");
        Ok(())
    }

    async fn await_boot(&self, vm_id: VmId, parent: Parent) -> Outcome<VmRecord> {
        match self.settings.prober.wait_running(self.api, &vm_id).await {
            Ok(summary) => Outcome::clean(VmRecord {
                id: vm_id,
                parent,
                state: summary.state,
            }),
            Err(err) => {
                let advisory = Advisory::warn(AdvisoryStep::BootReadiness, &vm_id, err.to_string());
                Outcome::with_advisories(
                    VmRecord {
                        id: vm_id,
                        parent,
                        state: VmState::Booting,
                    },
                    vec![advisory],
                )
            }
        }
    }

    async fn flush(&self, vm_id: &VmId) -> Option<Advisory> {
        let advise = |message: String| Advisory::warn(AdvisoryStep::PreCommitFlush, vm_id, message);

        let credentials = match self.api.fetch_credentials(vm_id).await {
            Ok(credentials) => credentials,
            Err(err) => return Some(advise(format!("credentials unavailable: {err}"))),
        };
        let session = match self.transport.open(vm_id, &credentials) {
            Ok(session) => session,
            Err(err) => return Some(advise(format!("session unavailable: {err}"))),
        };

        debug!(vm_id = %vm_id, "flushing guest filesystem before commit");
        let flushed = self
            .transport
            .run(&session, FLUSH_COMMAND, self.settings.flush_timeout)
            .await;
        let closed = self.transport.close(session);

        match (flushed, closed) {
            (Ok(_), Ok(())) => None,
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    warn!(vm_id = %vm_id, error = %close_err, "failed to close flush session");
                }
                Some(advise(format!("flush failed: {err}")))
            }
            (Ok(_), Err(err)) => Some(advise(format!("flush session cleanup failed: {err}"))),
        }
    }
}
