#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Binding options and context
pub mod config;

/// Error (common error types)
pub mod error;

/// Paths addressing nodes of a tree
pub mod path;

/// Patch ops and their application to JSON values
pub mod patch;

/// Field kinds per type tag
pub mod schema;

/// State tree contract and in-memory tree
pub mod tree;

/// Tree ⇄ CRDT sync
pub mod sync;

pub use config::{BindingContext, BindingOptions};
pub use error::{Result, SerializableError, SyncError};
pub use patch::PatchOp;
pub use path::{Path, PathKey};
pub use sync::{BindingState, SyncController};
pub use tree::{MemoryTree, StateTree};

#[cfg(test)]
pub mod test_utils;
