//! Declared-resource drivers.
//!
//! [`ResourceDriver`] gives each declared resource kind its create, read and
//! delete semantics on top of the core components. It owns the local
//! [`Ledger`]. Remote calls run without holding it; once they settle, the
//! driver re-reads the ledger, applies the change and saves it under a lock,
//! so concurrent operations on one driver never drop each other's records.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::advisory::Outcome;
use crate::api::{ImageId, LifecycleApi, VmId, VmState, VmSummary};
use crate::config::EngineConfig;
use crate::declaration::{
    BranchDeclaration, CommitDeclaration, DeclarationError, ProvisionDeclaration,
    RestoreDeclaration, VmDeclaration,
};
use crate::ledger::{CommitRecord, FileLedgerStore, Ledger, LedgerError, ProvisionRecord};
use crate::lineage::{
    ImageRecord, LineageCoordinator, LineageError, LineageGraphError, LineageNode,
    LineageSettings, VmRecord,
};
use crate::provision::{
    Convergence, Fingerprint, ProvisionError, ProvisionOrchestrator, ProvisionSettings,
};
use crate::transport::Transport;

/// Errors raised by resource operations.
#[derive(Debug, Error)]
pub enum ResourceError<ApiError>
where
    ApiError: std::error::Error + 'static,
{
    /// The declaration is invalid; nothing remote was attempted.
    #[error("configuration error: {0}")]
    Declaration(#[from] DeclarationError),
    /// Provisioning failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError<ApiError>),
    /// A lifecycle call failed.
    #[error(transparent)]
    Lineage(#[from] LineageError<ApiError>),
    /// The lineage graph rejected a record.
    #[error(transparent)]
    Graph(#[from] LineageGraphError),
    /// The local ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result of a commit unit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitResult {
    /// The trigger digest matched; the recorded image stands.
    Unchanged {
        /// Existing record.
        record: CommitRecord,
    },
    /// A new image was captured.
    Committed {
        /// Captured image and any flush advisory.
        outcome: Outcome<ImageRecord>,
    },
}

impl CommitResult {
    /// Image the unit currently stands for.
    #[must_use]
    pub const fn image_id(&self) -> &ImageId {
        match self {
            Self::Unchanged { record } => &record.image_id,
            Self::Committed { outcome } => &outcome.value.id,
        }
    }
}

/// What a refresh found.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RefreshReport {
    /// VMs that still exist, with their current state recorded.
    pub present: Vec<VmId>,
    /// VMs that no longer exist and were dropped locally.
    pub gone: Vec<VmId>,
}

/// Local view of one VM's lineage.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LineageView {
    /// The VM and its ancestors, nearest first.
    pub ancestry: Vec<LineageNode>,
    /// Images captured from the VM.
    pub images: Vec<ImageId>,
    /// VMs branched from the VM.
    pub branches: Vec<VmId>,
    /// VMs restored from any image of the VM.
    pub restored: Vec<VmId>,
}

/// Provisioning and lineage settings used by a driver.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DriverSettings {
    /// Provisioning bounds.
    pub provision: ProvisionSettings,
    /// Flush and boot bounds.
    pub lineage: LineageSettings,
}

impl DriverSettings {
    /// Derives settings from engine configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            provision: ProvisionSettings::from_config(config),
            lineage: LineageSettings::from_config(config),
        }
    }
}

/// Drives declared resources against the lifecycle API and transport.
#[derive(Debug)]
pub struct ResourceDriver<A, T> {
    api: A,
    transport: T,
    store: FileLedgerStore,
    settings: DriverSettings,
    ledger_lock: Mutex<()>,
}

impl<A, T> ResourceDriver<A, T>
where
    A: LifecycleApi,
    T: Transport,
{
    /// Creates a driver.
    #[must_use]
    pub const fn new(api: A, transport: T, store: FileLedgerStore, settings: DriverSettings) -> Self {
        Self {
            api,
            transport,
            store,
            settings,
            ledger_lock: Mutex::const_new(()),
        }
    }

    /// Lifecycle API in use.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Ledger store in use.
    #[must_use]
    pub const fn store(&self) -> &FileLedgerStore {
        &self.store
    }

    fn coordinator(&self) -> LineageCoordinator<'_, A, T> {
        LineageCoordinator::new(&self.api, &self.transport, self.settings.lineage)
    }

    fn orchestrator(&self) -> ProvisionOrchestrator<'_, A, T> {
        ProvisionOrchestrator::new(&self.api, &self.transport, self.settings.provision)
    }

    async fn snapshot(&self) -> Result<Ledger, ResourceError<A::Error>> {
        let _guard = self.ledger_lock.lock().await;
        Ok(self.store.load()?)
    }

    /// Loads, mutates and saves the ledger while holding the ledger lock.
    async fn update<R>(
        &self,
        apply: impl FnOnce(&mut Ledger) -> Result<R, ResourceError<A::Error>>,
    ) -> Result<R, ResourceError<A::Error>> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = self.store.load()?;
        let result = apply(&mut ledger)?;
        self.store.save(&ledger)?;
        Ok(result)
    }

    /// Creates a fresh VM and records it.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] for an invalid declaration, a failed create
    /// call or a ledger failure.
    pub async fn create_vm(
        &self,
        declaration: &VmDeclaration,
    ) -> Result<Outcome<VmRecord>, ResourceError<A::Error>> {
        let spec = declaration.validate()?;
        let outcome = self.coordinator().create(&spec).await?;
        self.update(|ledger| Ok(ledger.graph.record_vm(outcome.value.clone())?))
            .await?;
        Ok(outcome)
    }

    /// Deletes a VM remotely and forgets it locally.
    ///
    /// A VM that is already gone is only forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] when the lookup, the delete call or the
    /// ledger fails.
    pub async fn delete_vm(&self, vm_id: &VmId) -> Result<(), ResourceError<A::Error>> {
        let coordinator = self.coordinator();
        if coordinator.refresh(vm_id).await?.is_some() {
            coordinator.delete(vm_id).await?;
        } else {
            info!(vm_id = %vm_id, "vm already gone; forgetting it");
        }
        self.update(|ledger| {
            ledger.forget_vm(vm_id);
            Ok(())
        })
        .await
    }

    /// Applies a provisioning unit when its fingerprint changed.
    ///
    /// The declaration is validated before the ledger is read or anything
    /// remote is called. When the target VM turns out to be gone, its local
    /// records are dropped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] describing the first failure.
    pub async fn provision(
        &self,
        unit: &str,
        declaration: &ProvisionDeclaration,
    ) -> Result<Convergence, ResourceError<A::Error>> {
        let spec = declaration.validate()?;
        let previous = self
            .snapshot()
            .await?
            .applied_fingerprint(unit, &spec.vm_id)
            .cloned();

        let convergence = match self.orchestrator().converge(&spec, previous.as_ref()).await {
            Ok(convergence) => convergence,
            Err(err) => {
                if err.is_gone() {
                    self.update(|ledger| {
                        ledger.forget_vm(&spec.vm_id);
                        Ok(())
                    })
                    .await?;
                }
                return Err(err.into());
            }
        };

        let record = ProvisionRecord {
            vm_id: spec.vm_id.clone(),
            fingerprint: convergence.fingerprint().clone(),
        };
        self.update(|ledger| {
            ledger.provisions.insert(unit.to_owned(), record);
            Ok(())
        })
        .await?;
        Ok(convergence)
    }

    /// Captures an image when the unit's trigger digest changed.
    ///
    /// Without a unit name every call captures a new image.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] for an invalid declaration, a failed
    /// capture or a ledger failure. Flush failures are advisories.
    pub async fn commit(
        &self,
        unit: Option<&str>,
        declaration: &CommitDeclaration,
    ) -> Result<CommitResult, ResourceError<A::Error>> {
        let vm_id = declaration.vm()?;
        let digest = Fingerprint::of_commit(&vm_id, declaration.keep_paused, &declaration.triggers);

        if let Some(name) = unit {
            let mut ledger = self.snapshot().await?;
            if let Some(record) = ledger
                .commits
                .remove(name)
                .filter(|record| record.digest == digest)
            {
                info!(vm_id = %vm_id, image_id = %record.image_id, "commit triggers unchanged; keeping image");
                return Ok(CommitResult::Unchanged { record });
            }
        }

        let keep_paused = declaration.keep_paused;
        let outcome = self.coordinator().commit(&vm_id, keep_paused).await?;
        self.update(|ledger| {
            ledger.graph.record_image(outcome.value.clone())?;
            if keep_paused {
                ledger.graph.set_state(&vm_id, VmState::Paused);
            }
            if let Some(name) = unit {
                ledger.commits.insert(
                    name.to_owned(),
                    CommitRecord {
                        vm_id: vm_id.clone(),
                        image_id: outcome.value.id.clone(),
                        digest,
                        keep_paused,
                    },
                );
            }
            Ok(())
        })
        .await?;
        Ok(CommitResult::Committed { outcome })
    }

    /// Forgets an image locally. The remote image is never deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Ledger`] when the ledger cannot be updated.
    pub async fn forget_image(
        &self,
        image_id: &ImageId,
    ) -> Result<Option<ImageRecord>, ResourceError<A::Error>> {
        self.update(|ledger| {
            ledger
                .commits
                .retain(|_, record| &record.image_id != image_id);
            Ok(ledger.graph.forget_image(image_id))
        })
        .await
    }

    /// Restores a VM from an image and records it.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] for an invalid declaration, a failed restore
    /// call or a ledger failure. A boot timeout is an advisory.
    pub async fn restore(
        &self,
        declaration: &RestoreDeclaration,
    ) -> Result<Outcome<VmRecord>, ResourceError<A::Error>> {
        let image_id = declaration.image()?;
        let outcome = self.coordinator().restore(&image_id).await?;
        self.update(|ledger| Ok(ledger.graph.record_vm(outcome.value.clone())?))
            .await?;
        Ok(outcome)
    }

    /// Branches a running VM and records the clone.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] for an invalid declaration, a failed branch
    /// call or a ledger failure.
    pub async fn branch(
        &self,
        declaration: &BranchDeclaration,
    ) -> Result<VmRecord, ResourceError<A::Error>> {
        let source = declaration.source()?;
        let record = self.coordinator().branch(&source).await?;
        self.update(|ledger| Ok(ledger.graph.record_vm(record.clone())?))
            .await?;
        Ok(record)
    }

    /// Re-reads every recorded VM, dropping the ones that no longer exist.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] when a lookup or the ledger fails.
    pub async fn refresh(&self) -> Result<RefreshReport, ResourceError<A::Error>> {
        let coordinator = self.coordinator();
        let recorded: Vec<VmId> = self
            .snapshot()
            .await?
            .graph
            .vms()
            .map(|record| record.id.clone())
            .collect();
        let mut observed = Vec::with_capacity(recorded.len());
        for vm_id in recorded {
            let state = coordinator.refresh(&vm_id).await?.map(|summary| summary.state);
            observed.push((vm_id, state));
        }

        self.update(|ledger| {
            let mut report = RefreshReport::default();
            for (vm_id, state) in observed {
                if let Some(current) = state {
                    ledger.graph.set_state(&vm_id, current);
                    report.present.push(vm_id);
                } else {
                    warn!(vm_id = %vm_id, "vm no longer exists; dropping local records");
                    ledger.forget_vm(&vm_id);
                    report.gone.push(vm_id);
                }
            }
            Ok(report)
        })
        .await
    }

    /// Lists the remote inventory.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Lineage`] when the listing fails.
    pub async fn list_vms(&self) -> Result<Vec<VmSummary>, ResourceError<A::Error>> {
        Ok(self.coordinator().list().await?)
    }

    /// Pauses a VM and records the new state.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] when the call or the ledger fails.
    pub async fn pause(&self, vm_id: &VmId) -> Result<(), ResourceError<A::Error>> {
        self.coordinator().pause(vm_id).await?;
        self.record_state(vm_id, VmState::Paused).await
    }

    /// Resumes a VM and records the new state.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] when the call or the ledger fails.
    pub async fn resume(&self, vm_id: &VmId) -> Result<(), ResourceError<A::Error>> {
        self.coordinator().resume(vm_id).await?;
        self.record_state(vm_id, VmState::Running).await
    }

    async fn record_state(
        &self,
        vm_id: &VmId,
        state: VmState,
    ) -> Result<(), ResourceError<A::Error>> {
        self.update(|ledger| {
            ledger.graph.set_state(vm_id, state);
            Ok(())
        })
        .await
    }

    /// Local lineage of a VM.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Ledger`] when the ledger cannot be read.
    pub async fn lineage(&self, vm_id: &VmId) -> Result<LineageView, ResourceError<A::Error>> {
        let ledger = self.snapshot().await?;
        Ok(lineage_view(&ledger, vm_id))
    }
}

fn lineage_view(ledger: &Ledger, vm_id: &VmId) -> LineageView {
    let graph = &ledger.graph;
    let images: Vec<ImageId> = graph
        .images_of(vm_id)
        .into_iter()
        .map(|record| record.id.clone())
        .collect();
    let restored = images
        .iter()
        .flat_map(|image_id| graph.restored_from(image_id))
        .map(|record| record.id.clone())
        .collect();
    LineageView {
        ancestry: graph.ancestry(vm_id),
        branches: graph
            .branched_from(vm_id)
            .into_iter()
            .map(|record| record.id.clone())
            .collect(),
        images,
        restored,
    }
}
