//! Bidirectional sync between a [`StateTree`](crate::tree::StateTree) and a
//! yrs document root.
//!
//! - [`SnapshotConverter`] converts whole snapshots in either direction.
//! - [`CrdtEventTranslator`] turns document change batches into patches.
//! - [`TreePatchTranslator`] turns patch batches into document mutations.
//! - [`IdentityRegistry`] tracks which CRDT map belongs to which typed node.
//! - [`SyncController`] wires them together for one binding.

mod controller;
mod convert;
mod events;
mod identity;
mod translate;

pub use controller::{BindingState, BindingStats, SyncController};
pub use convert::{
    HandleMap, SnapshotConverter, any_to_value, read_map, read_out, value_to_in, write_root,
};
pub use events::{
    ContainerChange, CrdtEvent, CrdtEventTranslator, KeyChange, ListDelta, collect_events,
};
pub use identity::{IdentityRegistry, NodeEntry, RegistryDelta, typed_nodes};
pub use translate::{StagedBatch, TreePatchTranslator, stage_patches};
