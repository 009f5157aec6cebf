//! Append-only lineage of VMs and images.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ImageId, VmId, VmState};

/// The single parent edge of a VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "from", rename_all = "snake_case")]
pub enum Parent {
    /// Created from nothing.
    Fresh,
    /// Restored from a committed image.
    RestoredFrom(ImageId),
    /// Copy-on-write clone of a live VM.
    BranchedFrom(VmId),
}

/// A VM known to the lineage.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// VM identifier.
    pub id: VmId,
    /// Parent edge.
    pub parent: Parent,
    /// Last observed lifecycle state.
    pub state: VmState,
}

/// A committed image known to the lineage.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image identifier.
    pub id: ImageId,
    /// VM the image was captured from.
    pub source_vm: VmId,
    /// Whether the source VM was left paused.
    pub keep_paused: bool,
}

/// A node on an ancestry walk.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LineageNode {
    /// A VM.
    Vm(VmId),
    /// An image.
    Image(ImageId),
}

/// Errors raised when recording lineage.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LineageGraphError {
    /// The VM is already recorded.
    #[error("vm {0} is already recorded")]
    DuplicateVm(VmId),
    /// The image is already recorded.
    #[error("image {0} is already recorded")]
    DuplicateImage(ImageId),
    /// A VM would be its own parent.
    #[error("vm {0} cannot be branched from itself")]
    SelfBranch(VmId),
}

/// Forest of VMs and images linked by restored-from and branched-from edges.
///
/// Records are only ever added or forgotten, never re-parented, and a new
/// node can only point at nodes recorded before it, so the graph stays
/// acyclic. Parents recorded elsewhere are allowed and simply end a walk.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LineageGraph {
    #[serde(default)]
    vms: BTreeMap<VmId, VmRecord>,
    #[serde(default)]
    images: BTreeMap<ImageId, ImageRecord>,
}

impl LineageGraph {
    /// Records a new VM.
    ///
    /// # Errors
    ///
    /// Returns [`LineageGraphError`] for a duplicate or self-referencing VM.
    pub fn record_vm(&mut self, record: VmRecord) -> Result<(), LineageGraphError> {
        if self.vms.contains_key(&record.id) {
            return Err(LineageGraphError::DuplicateVm(record.id));
        }
        if record.parent == Parent::BranchedFrom(record.id.clone()) {
            return Err(LineageGraphError::SelfBranch(record.id));
        }
        self.vms.insert(record.id.clone(), record);
        Ok(())
    }

    /// Records a new image.
    ///
    /// # Errors
    ///
    /// Returns [`LineageGraphError::DuplicateImage`] when the image exists.
    pub fn record_image(&mut self, record: ImageRecord) -> Result<(), LineageGraphError> {
        if self.images.contains_key(&record.id) {
            return Err(LineageGraphError::DuplicateImage(record.id));
        }
        self.images.insert(record.id.clone(), record);
        Ok(())
    }

    /// Updates the observed state of a recorded VM. Returns `false` when the
    /// VM is unknown.
    pub fn set_state(&mut self, vm_id: &VmId, state: VmState) -> bool {
        self.vms.get_mut(vm_id).is_some_and(|record| {
            record.state = state;
            true
        })
    }

    /// Looks up a VM.
    #[must_use]
    pub fn vm(&self, vm_id: &VmId) -> Option<&VmRecord> {
        self.vms.get(vm_id)
    }

    /// Looks up an image.
    #[must_use]
    pub fn image(&self, image_id: &ImageId) -> Option<&ImageRecord> {
        self.images.get(image_id)
    }

    /// All recorded VMs in identifier order.
    pub fn vms(&self) -> impl Iterator<Item = &VmRecord> {
        self.vms.values()
    }

    /// All recorded images in identifier order.
    pub fn images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.images.values()
    }

    /// Walks from `vm_id` back to its root, starting with the VM itself.
    ///
    /// Returns an empty chain when the VM is unknown.
    #[must_use]
    pub fn ancestry(&self, vm_id: &VmId) -> Vec<LineageNode> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = self.vms.get(vm_id);
        while let Some(record) = cursor {
            if !seen.insert(record.id.clone()) {
                break;
            }
            chain.push(LineageNode::Vm(record.id.clone()));
            cursor = match &record.parent {
                Parent::Fresh => None,
                Parent::BranchedFrom(parent) => self.vms.get(parent),
                Parent::RestoredFrom(image_id) => {
                    chain.push(LineageNode::Image(image_id.clone()));
                    self.images
                        .get(image_id)
                        .and_then(|image| self.vms.get(&image.source_vm))
                }
            };
        }
        chain
    }

    /// VMs restored from `image_id`.
    #[must_use]
    pub fn restored_from(&self, image_id: &ImageId) -> Vec<&VmRecord> {
        self.vms
            .values()
            .filter(|record| matches!(&record.parent, Parent::RestoredFrom(parent) if parent == image_id))
            .collect()
    }

    /// VMs branched from `vm_id`.
    #[must_use]
    pub fn branched_from(&self, vm_id: &VmId) -> Vec<&VmRecord> {
        self.vms
            .values()
            .filter(|record| matches!(&record.parent, Parent::BranchedFrom(parent) if parent == vm_id))
            .collect()
    }

    /// Images captured from `vm_id`.
    #[must_use]
    pub fn images_of(&self, vm_id: &VmId) -> Vec<&ImageRecord> {
        self.images
            .values()
            .filter(|record| &record.source_vm == vm_id)
            .collect()
    }

    /// Drops the local record of a VM. Children keep their parent edge.
    pub fn forget_vm(&mut self, vm_id: &VmId) -> Option<VmRecord> {
        self.vms.remove(vm_id)
    }

    /// Drops the local record of an image. The remote image is untouched.
    pub fn forget_image(&mut self, image_id: &ImageId) -> Option<ImageRecord> {
        self.images.remove(image_id)
    }
}
