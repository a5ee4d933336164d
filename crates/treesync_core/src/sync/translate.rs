//! Tree → document: applying patch batches to the CRDT.
//!
//! yrs transactions cannot be rolled back, so a batch is validated in full
//! before the document is touched. [`stage_patches`] replays the batch on a
//! copy of the binding's mirror (the last state both sides agreed on),
//! checking paths, schema kinds and identities along the way. Only when the
//! whole batch stages cleanly does [`TreePatchTranslator`] open a single
//! transaction and write it.

use serde_json::Value;
use yrs::{Array, ArrayRef, Map, MapRef, Out, TransactionMut};

use super::convert::{HandleMap, read_map, read_out, value_to_in, write_root};
use super::identity::{IdentityRegistry, RegistryDelta};
use crate::config::BindingContext;
use crate::error::{Result, SyncError};
use crate::patch::{PatchOp, apply_patch, get, kind_name};
use crate::path::{Path, PathKey};

/// Result of replaying a batch on a mirror copy.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    /// Mirror state after the batch.
    pub mirror: Value,
    /// Identity changes the batch causes.
    pub delta: RegistryDelta,
}

/// Replay `patches` on a copy of `mirror`.
///
/// Fails without side effects if any op targets a missing path, breaks the
/// schema, carries a malformed typed node, or would leave two live subtrees
/// with the same identifier.
pub fn stage_patches<H: Clone>(
    ctx: &BindingContext,
    mirror: &Value,
    patches: &[PatchOp],
    registry: &IdentityRegistry<H>,
) -> Result<StagedBatch> {
    let options = &ctx.options;
    let mut scratch = mirror.clone();
    let mut delta = RegistryDelta::default();

    for op in patches {
        let path = op.path();
        if let Some(value) = op.value() {
            let kind = ctx.schema.kind_at(&scratch, path, options)?;
            ctx.schema.check(value, &kind, path, options)?;
        }

        // Identity of the node owning a reserved field, before the op.
        let owner = reserved_owner(path, options.is_reserved(path_field(path)));
        let before = match &owner {
            Some(parent) => identity(&scratch, parent, ctx)?,
            None => None,
        };

        let old = apply_patch(&mut scratch, op)?;
        if let Some(old) = &old {
            delta.remove_subtree(old, path, options)?;
        }
        if let Some(value) = op.value() {
            delta.add_subtree(value, path, options)?;
        }

        if let Some(parent) = &owner {
            let after = identity(&scratch, parent, ctx)?;
            if before != after {
                if let Some((id, _)) = before {
                    delta.removed.push(id);
                }
                if let Some(identity) = after {
                    delta.added.push(identity);
                }
            }
        }
    }

    registry.check(&delta)?;
    Ok(StagedBatch {
        mirror: scratch,
        delta,
    })
}

fn path_field(path: &Path) -> &str {
    path.last().and_then(PathKey::as_field).unwrap_or_default()
}

fn reserved_owner(path: &Path, reserved: bool) -> Option<Path> {
    if !reserved {
        return None;
    }
    path.split_last().map(|(parent, _)| parent)
}

fn identity(root: &Value, path: &Path, ctx: &BindingContext) -> Result<Option<(String, String)>> {
    let Some(node) = get(root, path) else {
        return Ok(None);
    };
    Ok(ctx
        .options
        .identity_of(node, path)?
        .map(|(id, tag)| (id.to_string(), tag.to_string())))
}

enum Container {
    Map(MapRef),
    Array(ArrayRef),
}

/// Walk from the root map down to the shared container at `path`.
fn resolve(txn: &TransactionMut, root: &MapRef, path: &Path) -> Result<Container> {
    let mut current = Container::Map(root.clone());
    for (depth, key) in path.iter().enumerate() {
        let here = path.prefix(depth + 1);
        let out = match (&current, key) {
            (Container::Map(map), PathKey::Field(name)) => map.get(txn, name),
            (Container::Array(array), PathKey::Index(i)) => array.get(txn, *i as u32),
            (Container::Map(_), PathKey::Index(_)) => {
                return Err(SyncError::mismatch(&here, "field name", "list index"));
            }
            (Container::Array(_), PathKey::Field(_)) => {
                return Err(SyncError::mismatch(&here, "list index", "field name"));
            }
        };
        current = match out {
            Some(Out::YMap(map)) => Container::Map(map),
            Some(Out::YArray(array)) => Container::Array(array),
            Some(_) => return Err(SyncError::mismatch(&here, "container", "leaf value")),
            None => return Err(SyncError::not_found(&here)),
        };
    }
    Ok(current)
}

/// Translates tree patch batches into CRDT mutations.
pub struct TreePatchTranslator<'a> {
    ctx: &'a BindingContext,
}

impl<'a> TreePatchTranslator<'a> {
    /// Create a translator for the given binding context.
    pub fn new(ctx: &'a BindingContext) -> Self {
        Self { ctx }
    }

    /// Validate `patches` against `mirror`. See [`stage_patches`].
    pub fn stage<H: Clone>(
        &self,
        mirror: &Value,
        patches: &[PatchOp],
        registry: &IdentityRegistry<H>,
    ) -> Result<StagedBatch> {
        stage_patches(self.ctx, mirror, patches, registry)
    }

    /// Write an already staged batch into `root` inside `txn`.
    ///
    /// Returns the handles of the typed nodes in `added`, for the identity
    /// registry. A failure here means the document and the mirror disagree.
    pub fn write(
        &self,
        txn: &mut TransactionMut,
        root: &MapRef,
        patches: &[PatchOp],
        added: &[(String, String)],
    ) -> Result<HandleMap> {
        let options = &self.ctx.options;
        let mut handles = HandleMap::new();

        for op in patches {
            let path = op.path();
            let Some((parent, last)) = path.split_last() else {
                match op {
                    PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                        write_root(txn, root, value, path)?;
                        read_map(&*txn, root, path, options, &mut handles)?;
                    }
                    PatchOp::Remove { .. } => return Err(SyncError::not_found(path)),
                }
                continue;
            };

            let inserted = match (resolve(txn, root, &parent)?, last) {
                (Container::Map(map), PathKey::Field(key)) => match op {
                    PatchOp::Add { value, .. } => {
                        Some(map.insert(txn, key.as_str(), value_to_in(value)))
                    }
                    PatchOp::Replace { value, .. } => {
                        if map.get(&*txn, key).is_none() {
                            return Err(SyncError::not_found(path));
                        }
                        Some(map.insert(txn, key.as_str(), value_to_in(value)))
                    }
                    PatchOp::Remove { .. } => {
                        map.remove(txn, key).ok_or_else(|| SyncError::not_found(path))?;
                        None
                    }
                },
                (Container::Array(array), PathKey::Index(i)) => {
                    let len = array.len(&*txn) as usize;
                    let index = *i as u32;
                    match op {
                        PatchOp::Add { value, .. } => {
                            if *i > len {
                                return Err(SyncError::not_found(path));
                            }
                            Some(array.insert(txn, index, value_to_in(value)))
                        }
                        PatchOp::Replace { value, .. } => {
                            if *i >= len {
                                return Err(SyncError::not_found(path));
                            }
                            array.remove(txn, index);
                            Some(array.insert(txn, index, value_to_in(value)))
                        }
                        PatchOp::Remove { .. } => {
                            if *i >= len {
                                return Err(SyncError::not_found(path));
                            }
                            array.remove(txn, index);
                            None
                        }
                    }
                }
                (Container::Map(_), PathKey::Index(_)) => {
                    return Err(SyncError::mismatch(path, "field name", "list index"));
                }
                (Container::Array(_), PathKey::Field(_)) => {
                    return Err(SyncError::mismatch(path, "list index", "field name"));
                }
            };

            if let Some(out) = inserted {
                read_out(&*txn, &out, path, options, &mut handles)?;
            }
        }

        // An identity written field by field onto an existing map is not
        // visible in any inserted value.
        if added.iter().any(|(id, _)| !handles.contains_key(id)) {
            read_map(&*txn, root, &Path::root(), options, &mut handles)?;
        }
        Ok(handles)
    }
}

/// Short form of an op for log lines.
pub(crate) fn describe(op: &PatchOp) -> String {
    match op.value() {
        Some(value) => format!("{} ({})", op.path(), kind_name(value)),
        None => op.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use crate::sync::convert::SnapshotConverter;
    use crate::test_utils::{sample_tree, test_context};
    use serde_json::json;
    use yrs::{Doc, Transact};

    struct Fixture {
        ctx: BindingContext,
        doc: Doc,
        root: MapRef,
        mirror: Value,
        registry: IdentityRegistry<MapRef>,
    }

    fn fixture() -> Fixture {
        let ctx = test_context();
        let doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        let mirror = sample_tree();
        let mut handles = HandleMap::new();
        {
            let mut txn = doc.transact_mut();
            write_root(&mut txn, &root, &mirror, &Path::root()).unwrap();
            read_map(&txn, &root, &Path::root(), &ctx.options, &mut handles).unwrap();
        }
        let mut registry = IdentityRegistry::new();
        for (id, handle) in handles {
            registry.register(&id, "node", handle).unwrap();
        }
        Fixture {
            ctx,
            doc,
            root,
            mirror,
            registry,
        }
    }

    fn apply(fx: &mut Fixture, patches: &[PatchOp]) -> Result<HandleMap> {
        let translator = TreePatchTranslator::new(&fx.ctx);
        let staged = translator.stage(&fx.mirror, patches, &fx.registry)?;
        let handles = {
            let mut txn = fx.doc.transact_mut();
            translator.write(&mut txn, &fx.root, patches, &staged.delta.added)?
        };
        fx.registry.commit(&staged.delta, |id| handles.get(id).cloned())?;
        fx.mirror = staged.mirror;
        Ok(handles)
    }

    fn doc_snapshot(fx: &Fixture) -> Value {
        let txn = fx.doc.transact();
        SnapshotConverter::new(&fx.ctx)
            .to_snapshot(&txn, &Out::YMap(fx.root.clone()))
            .unwrap()
    }

    #[test]
    fn test_document_matches_tree_after_batch() {
        let mut fx = fixture();
        let patches = vec![
            PatchOp::replace(path!["title"], "Errands"),
            PatchOp::add(
                path!["todos", 1],
                json!({"$modelId": "t-3", "$modelType": "todo", "text": "eggs", "done": false}),
            ),
            PatchOp::remove(path!["todos", 0]),
            PatchOp::add(path!["tags", "when"], "today"),
            PatchOp::replace(path!["todos", 0, "done"], true),
        ];
        apply(&mut fx, &patches).unwrap();

        let mut expected = sample_tree();
        crate::patch::apply_patches(&mut expected, &patches).unwrap();
        assert_eq!(doc_snapshot(&fx), expected);
        assert_eq!(fx.mirror, expected);
    }

    #[test]
    fn test_rejected_batch_leaves_document_untouched() {
        let mut fx = fixture();
        let before = doc_snapshot(&fx);
        let err = apply(
            &mut fx,
            &[
                PatchOp::replace(path!["title"], "changed"),
                PatchOp::remove(path!["todos", 7]),
            ],
        )
        .unwrap_err();

        assert!(matches!(err, SyncError::PathNotFound { .. }));
        assert_eq!(doc_snapshot(&fx), before);
        assert_eq!(fx.mirror, sample_tree());
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let mut fx = fixture();
        let err = apply(&mut fx, &[PatchOp::replace(path!["todos"], json!({"a": 1}))]).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let mut fx = fixture();
        let copy = fx.mirror["todos"][0].clone();
        let err = apply(&mut fx, &[PatchOp::add(path!["todos", 0], copy)]).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateIdentity { ref id } if id == "t-1"));
        assert_eq!(doc_snapshot(&fx), sample_tree());
    }

    #[test]
    fn test_move_keeps_identity_and_rebinds_handle() {
        let mut fx = fixture();
        let old_handle = fx.registry.handle("t-1").cloned().unwrap();
        let moved = fx.mirror["todos"][0].clone();
        apply(
            &mut fx,
            &[PatchOp::remove(path!["todos", 0]), PatchOp::add(path!["todos", 1], moved)],
        )
        .unwrap();

        assert_eq!(fx.mirror["todos"][1]["$modelId"], json!("t-1"));
        let new_handle = fx.registry.handle("t-1").cloned().unwrap();
        assert_ne!(new_handle, old_handle);
        assert_eq!(fx.registry.len(), 3);
    }

    #[test]
    fn test_new_typed_node_is_registered() {
        let mut fx = fixture();
        let handles = apply(
            &mut fx,
            &[PatchOp::add(
                path!["todos", 0],
                json!({"$modelId": "t-9", "$modelType": "todo", "text": "x"}),
            )],
        )
        .unwrap();
        assert!(handles.contains_key("t-9"));
        assert!(fx.registry.contains("t-9"));
    }

    #[test]
    fn test_removed_subtree_is_deregistered() {
        let mut fx = fixture();
        apply(&mut fx, &[PatchOp::replace(path!["todos"], json!([]))]).unwrap();
        assert!(!fx.registry.contains("t-1"));
        assert!(!fx.registry.contains("t-2"));
        assert!(fx.registry.contains("list-1"));
    }

    #[test]
    fn test_root_replace_rewrites_document() {
        let mut fx = fixture();
        let next = json!({
            "$modelId": "list-1", "$modelType": "todoList", "title": "Fresh", "todos": []
        });
        apply(&mut fx, &[PatchOp::replace(Path::root(), next.clone())]).unwrap();
        assert_eq!(doc_snapshot(&fx), next);
        assert_eq!(fx.registry.len(), 1);
    }

    #[test]
    fn test_root_remove_is_not_found() {
        let mut fx = fixture();
        let err = apply(&mut fx, &[PatchOp::remove(Path::root())]).unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound { .. }));
    }

    #[test]
    fn test_reserved_field_edit_changes_identity() {
        let mut fx = fixture();
        apply(&mut fx, &[PatchOp::replace(path!["todos", 1, "$modelId"], "t-22")]).unwrap();
        assert!(!fx.registry.contains("t-2"));
        assert!(fx.registry.contains("t-22"));

        let err = apply(&mut fx, &[PatchOp::remove(path!["todos", 0, "$modelId"])]).unwrap_err();
        assert!(matches!(err, SyncError::MalformedNode { .. }));
    }
}
