//! Document → tree: translating CRDT change batches into patches.
//!
//! A deep-change batch from yrs is first read into engine-neutral
//! [`CrdtEvent`]s by [`collect_events`], then turned into an ordered list of
//! [`PatchOp`]s by [`CrdtEventTranslator`].
//!
//! # List deltas
//!
//! A list delta is a cursor walk: `retain(n)` moves the cursor, `insert(v…)`
//! emits one `add` per element at the cursor and moves past them,
//! `delete(n)` emits `n` `remove`s at the cursor without moving it (the
//! following elements shift down).
//!
//! ```text
//! [10, 20, 30]   retain(1) delete(1) insert([99])
//!                → remove /1, add /1 99
//!                → [10, 99, 30]
//! ```
//!
//! # Nested values
//!
//! Containers inside inserted or updated values are flattened: the container
//! is emitted empty (a typed node keeps only its identity fields) and every
//! child follows as its own `add`. A typed node the identity registry has
//! never seen is the exception: it is emitted as one `add` carrying the
//! whole subtree.

use serde_json::{Map as JsonMap, Value};
use yrs::types::{Change, EntryChange, Event, Events, PathSegment};
use yrs::{GetString, TransactionMut};

use super::convert::{HandleMap, read_out};
use super::identity::IdentityRegistry;
use crate::config::BindingOptions;
use crate::error::{Result, SyncError};
use crate::patch::PatchOp;
use crate::path::{Path, PathKey};

/// One instruction of an ordered-container delta.
#[derive(Debug, Clone, PartialEq)]
pub enum ListDelta {
    /// Skip over `n` unchanged elements.
    Retain(u32),
    /// Insert the values at the cursor.
    Insert(Vec<Value>),
    /// Delete `n` elements at the cursor.
    Delete(u32),
}

/// Change of one key of a keyed container.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyChange {
    /// The key was absent and now holds the value.
    Added(Value),
    /// The key held another value and now holds this one.
    Updated(Value),
    /// The key was removed.
    Deleted,
}

/// The delta of one container.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerChange {
    /// Delta of an ordered container.
    List(Vec<ListDelta>),
    /// Key changes of a keyed container, in the order they are translated.
    Map(Vec<(String, KeyChange)>),
}

/// A change to one container, addressed from the document root.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtEvent {
    /// Path of the changed container.
    pub path: Path,
    /// What changed in it.
    pub change: ContainerChange,
}

impl CrdtEvent {
    /// A list delta at `path`.
    pub fn list(path: Path, delta: Vec<ListDelta>) -> Self {
        Self {
            path,
            change: ContainerChange::List(delta),
        }
    }

    /// Key changes at `path`.
    pub fn map(path: Path, keys: Vec<(String, KeyChange)>) -> Self {
        Self {
            path,
            change: ContainerChange::Map(keys),
        }
    }
}

/// Translates [`CrdtEvent`] batches into tree patches.
pub struct CrdtEventTranslator<'a, H> {
    options: &'a BindingOptions,
    registry: &'a IdentityRegistry<H>,
}

impl<'a, H: Clone> CrdtEventTranslator<'a, H> {
    /// Create a translator consulting `registry` for first-sight decisions.
    pub fn new(options: &'a BindingOptions, registry: &'a IdentityRegistry<H>) -> Self {
        Self { options, registry }
    }

    /// Translate a batch, preserving the order of its events.
    pub fn translate(&self, events: &[CrdtEvent]) -> Result<Vec<PatchOp>> {
        let mut ops = Vec::new();
        for event in events {
            match &event.change {
                ContainerChange::List(delta) => self.translate_list(&event.path, delta, &mut ops)?,
                ContainerChange::Map(keys) => self.translate_map(&event.path, keys, &mut ops)?,
            }
        }
        Ok(ops)
    }

    fn translate_list(
        &self,
        path: &Path,
        delta: &[ListDelta],
        ops: &mut Vec<PatchOp>,
    ) -> Result<()> {
        let mut cursor: usize = 0;
        for step in delta {
            match step {
                ListDelta::Retain(n) => cursor += *n as usize,
                ListDelta::Insert(values) => {
                    for value in values {
                        self.emit(path.child(cursor), value, false, ops)?;
                        cursor += 1;
                    }
                }
                ListDelta::Delete(n) => {
                    for _ in 0..*n {
                        ops.push(PatchOp::remove(path.child(cursor)));
                    }
                }
            }
        }
        Ok(())
    }

    fn translate_map(
        &self,
        path: &Path,
        keys: &[(String, KeyChange)],
        ops: &mut Vec<PatchOp>,
    ) -> Result<()> {
        for (key, change) in keys {
            let target = path.child(key.as_str());
            match change {
                KeyChange::Added(value) => self.emit(target, value, false, ops)?,
                KeyChange::Updated(value) => self.emit(target, value, true, ops)?,
                KeyChange::Deleted => ops.push(PatchOp::remove(target)),
            }
        }
        Ok(())
    }

    /// Emit `value` at `path`, flattening containers.
    fn emit(&self, path: Path, value: &Value, replace: bool, ops: &mut Vec<PatchOp>) -> Result<()> {
        let op = |path: Path, value: Value| {
            if replace {
                PatchOp::replace(path, value)
            } else {
                PatchOp::add(path, value)
            }
        };

        match value {
            Value::Object(map) => {
                let mut skeleton = JsonMap::new();
                if let Some((id, tag)) = self.options.identity_of(value, &path)? {
                    if self.options.first_sight_snapshots && !self.registry.contains(id) {
                        ops.push(op(path, value.clone()));
                        return Ok(());
                    }
                    skeleton.insert(self.options.id_field.clone(), Value::String(id.to_string()));
                    skeleton.insert(
                        self.options.type_field.clone(),
                        Value::String(tag.to_string()),
                    );
                }
                ops.push(op(path.clone(), Value::Object(skeleton)));
                for (key, child) in map {
                    if self.options.is_reserved(key) {
                        continue;
                    }
                    self.emit(path.child(key.as_str()), child, false, ops)?;
                }
            }
            Value::Array(items) => {
                ops.push(op(path.clone(), Value::Array(Vec::new())));
                for (i, child) in items.iter().enumerate() {
                    self.emit(path.child(i), child, false, ops)?;
                }
            }
            primitive => ops.push(op(path, primitive.clone())),
        }
        Ok(())
    }
}

fn convert_path(segments: yrs::types::Path) -> Path {
    segments
        .into_iter()
        .map(|segment| match segment {
            PathSegment::Key(key) => PathKey::Field(key.to_string()),
            PathSegment::Index(i) => PathKey::Index(i as usize),
        })
        .collect()
}

/// Read a yrs deep-change batch into [`CrdtEvent`]s.
///
/// Every typed map met in inserted or updated values is recorded in
/// `handles`, so the caller can register it once the batch commits. Map key
/// changes are sorted by key to make the output deterministic. A change to a
/// `Y.Text` leaf becomes a replacement of the whole string.
pub fn collect_events(
    txn: &TransactionMut,
    events: &Events,
    options: &BindingOptions,
    handles: &mut HandleMap,
) -> Result<Vec<CrdtEvent>> {
    let mut out = Vec::new();
    for event in events.iter() {
        let path = convert_path(event.path());
        match event {
            Event::Array(array_event) => {
                let mut cursor: usize = 0;
                let mut delta = Vec::new();
                for change in array_event.delta(txn) {
                    match change {
                        Change::Added(values) => {
                            let mut inserted = Vec::with_capacity(values.len());
                            for value in values {
                                let child = path.child(cursor);
                                inserted.push(read_out(txn, value, &child, options, handles)?);
                                cursor += 1;
                            }
                            delta.push(ListDelta::Insert(inserted));
                        }
                        Change::Removed(n) => delta.push(ListDelta::Delete(*n)),
                        Change::Retain(n) => {
                            cursor += *n as usize;
                            delta.push(ListDelta::Retain(*n));
                        }
                    }
                }
                out.push(CrdtEvent::list(path, delta));
            }
            Event::Map(map_event) => {
                let mut keys: Vec<(String, &EntryChange)> = map_event
                    .keys(txn)
                    .iter()
                    .map(|(k, change)| (k.to_string(), change))
                    .collect();
                keys.sort_by(|(a, _), (b, _)| a.cmp(b));

                let mut changes = Vec::with_capacity(keys.len());
                for (key, change) in keys {
                    let key_path = path.child(key.as_str());
                    let change = match change {
                        EntryChange::Inserted(value) => {
                            KeyChange::Added(read_out(txn, value, &key_path, options, handles)?)
                        }
                        EntryChange::Updated(_, value) => {
                            KeyChange::Updated(read_out(txn, value, &key_path, options, handles)?)
                        }
                        EntryChange::Removed(_) => KeyChange::Deleted,
                    };
                    changes.push((key, change));
                }
                out.push(CrdtEvent::map(path, changes));
            }
            Event::Text(text_event) => {
                let content = Value::String(text_event.target().get_string(txn));
                let Some((parent, last)) = path.split_last() else {
                    return Err(SyncError::mismatch(&path, "map root", "text"));
                };
                let event = match last {
                    PathKey::Field(key) => {
                        CrdtEvent::map(parent, vec![(key.clone(), KeyChange::Updated(content))])
                    }
                    PathKey::Index(i) => CrdtEvent::list(
                        parent,
                        vec![
                            ListDelta::Retain(*i as u32),
                            ListDelta::Delete(1),
                            ListDelta::Insert(vec![content]),
                        ],
                    ),
                };
                out.push(event);
            }
            _ => {
                return Err(SyncError::mismatch(&path, "map, list or text", "xml or link"));
            }
        }
    }
    Ok(out)
}
