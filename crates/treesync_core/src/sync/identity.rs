//! Identity registry: node identifier ⇄ CRDT subtree handle.
//!
//! The CRDT document has no notion of typed objects; typed nodes are plain
//! maps that happen to carry an identifier field. The registry remembers which
//! live map handle belongs to which identifier, so the binding can tell a
//! node it has seen before from a brand-new one, and can refuse a second live
//! subtree claiming an identifier that is already taken.
//!
//! Changes produced by one batch are gathered in a [`RegistryDelta`] and
//! committed together after the batch itself has committed.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::BindingOptions;
use crate::error::{Result, SyncError};
use crate::path::Path;

/// A registered typed node.
#[derive(Debug, Clone)]
pub struct NodeEntry<H> {
    /// Type tag the node was registered with.
    pub type_tag: String,
    /// Handle to the node's CRDT subtree.
    pub handle: H,
}

/// Bidirectional bookkeeping between node identifiers and CRDT handles.
///
/// Generic over the handle type; the binding uses [`yrs::MapRef`].
#[derive(Debug, Clone)]
pub struct IdentityRegistry<H> {
    entries: HashMap<String, NodeEntry<H>>,
}

impl<H> Default for IdentityRegistry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H: Clone> IdentityRegistry<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` against `handle`.
    ///
    /// Fails with `DuplicateIdentity` if `id` already has a live handle.
    pub fn register(&mut self, id: &str, type_tag: &str, handle: H) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(SyncError::DuplicateIdentity { id: id.to_string() });
        }
        self.entries.insert(
            id.to_string(),
            NodeEntry {
                type_tag: type_tag.to_string(),
                handle,
            },
        );
        Ok(())
    }

    /// Remove `id`, returning its entry if it was registered.
    pub fn deregister(&mut self, id: &str) -> Option<NodeEntry<H>> {
        self.entries.remove(id)
    }

    /// Whether `id` has a live handle.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up the entry for `id`.
    pub fn get(&self, id: &str) -> Option<&NodeEntry<H>> {
        self.entries.get(id)
    }

    /// The handle registered for `id`.
    pub fn handle(&self, id: &str) -> Option<&H> {
        self.entries.get(id).map(|e| &e.handle)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Registered identifiers, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Net number of live handles `id` would have after `delta`.
    fn net_count(&self, id: &str, delta: &RegistryDelta) -> i64 {
        let base = i64::from(self.contains(id));
        let removed = delta.removed.iter().filter(|r| *r == id).count() as i64;
        let added = delta.added.iter().filter(|(a, _)| a == id).count() as i64;
        base - removed + added
    }

    /// Check that `delta` can be committed without leaving two live
    /// subtrees with the same identifier.
    pub fn check(&self, delta: &RegistryDelta) -> Result<()> {
        for (id, _) in &delta.added {
            if self.net_count(id, delta) > 1 {
                return Err(SyncError::DuplicateIdentity { id: id.clone() });
            }
        }
        Ok(())
    }

    /// Commit `delta`: removals first, then the additions that are still
    /// live at the end of the batch, with handles from `resolve`.
    ///
    /// A node removed and re-added in one batch (a move) ends up registered
    /// against its new handle; one added and removed again is dropped.
    /// Additions whose handle cannot be resolved are skipped with a warning.
    pub fn commit<F>(&mut self, delta: &RegistryDelta, mut resolve: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<H>,
    {
        self.check(delta)?;
        let live: Vec<&(String, String)> = delta
            .added
            .iter()
            .filter(|(id, _)| self.net_count(id, delta) == 1)
            .collect();
        for id in &delta.removed {
            self.deregister(id);
        }
        for (id, type_tag) in live {
            if self.contains(id) {
                continue;
            }
            match resolve(id) {
                Some(handle) => self.register(id, type_tag, handle)?,
                None => log::warn!("[IdentityRegistry] no CRDT handle found for node '{}'", id),
            }
        }
        Ok(())
    }
}

/// Identity changes caused by one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryDelta {
    /// Identifiers whose subtree left the document.
    pub removed: Vec<String>,
    /// `(identifier, type tag)` of typed nodes that entered it.
    pub added: Vec<(String, String)>,
}

impl RegistryDelta {
    /// Whether the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Record every typed node in `value` as removed.
    pub fn remove_subtree(
        &mut self,
        value: &Value,
        path: &Path,
        options: &BindingOptions,
    ) -> Result<()> {
        self.removed
            .extend(typed_nodes(value, path, options)?.into_iter().map(|(id, _)| id));
        Ok(())
    }

    /// Record every typed node in `value` as added.
    pub fn add_subtree(
        &mut self,
        value: &Value,
        path: &Path,
        options: &BindingOptions,
    ) -> Result<()> {
        self.added.extend(typed_nodes(value, path, options)?);
        Ok(())
    }
}

/// Collect `(id, type tag)` for every typed node in `value`, depth first.
pub fn typed_nodes(
    value: &Value,
    path: &Path,
    options: &BindingOptions,
) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    collect_typed(value, path, options, &mut out)?;
    Ok(out)
}

fn collect_typed(
    value: &Value,
    path: &Path,
    options: &BindingOptions,
    out: &mut Vec<(String, String)>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            if let Some((id, tag)) = options.identity_of(value, path)? {
                out.push((id.to_string(), tag.to_string()));
            }
            for (key, child) in map {
                collect_typed(child, &path.child(key.as_str()), options, out)?;
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_typed(child, &path.child(i), options, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}
