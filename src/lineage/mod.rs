//! Snapshot lineage coordinator.
//!
//! Images are immutable and never deleted remotely; VMs have exactly one
//! parent edge. Together they form the [`LineageGraph`], a forest that only
//! grows.

mod coordinator;
mod error;
mod graph;

pub use coordinator::{FLUSH_COMMAND, LineageCoordinator, LineageSettings};
pub use error::LineageError;
pub use graph::{ImageRecord, LineageGraph, LineageGraphError, LineageNode, Parent, VmRecord};
