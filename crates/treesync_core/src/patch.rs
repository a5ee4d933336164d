//! Patch operations and their application to JSON snapshots.
//!
//! [`PatchOp`] is the tree side's change representation: JSON Patch
//! restricted to `add`, `remove` and `replace`, addressed by [`Path`] rather
//! than a pointer string. [`apply_patches`] is the reference applier; it is
//! atomic (a batch is applied to a copy and swapped in only if every op
//! succeeds) and is used both by [`MemoryTree`](crate::tree::MemoryTree) and by
//! the sync controller to re-validate a batch before it reaches the other side.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{Result, SyncError};
use crate::path::{Path, PathKey};

/// A single normalized tree mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert into a list at `path`, or set a map field.
    Add {
        /// Position of the new element.
        path: Path,
        /// The inserted value.
        value: Value,
    },
    /// Delete the element at `path`.
    Remove {
        /// Position of the removed element.
        path: Path,
    },
    /// Overwrite the existing element at `path`.
    Replace {
        /// Position of the changed element.
        path: Path,
        /// The new value.
        value: Value,
    },
}

impl PatchOp {
    /// Create an `add` op.
    pub fn add(path: Path, value: impl Into<Value>) -> Self {
        PatchOp::Add {
            path,
            value: value.into(),
        }
    }

    /// Create a `remove` op.
    pub fn remove(path: Path) -> Self {
        PatchOp::Remove { path }
    }

    /// Create a `replace` op.
    pub fn replace(path: Path, value: impl Into<Value>) -> Self {
        PatchOp::Replace {
            path,
            value: value.into(),
        }
    }

    /// The path this op addresses.
    pub fn path(&self) -> &Path {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. } => path,
        }
    }

    /// The value carried by `add`/`replace`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => Some(value),
            PatchOp::Remove { .. } => None,
        }
    }
}

/// Short name of a JSON value's kind, for error messages.
pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Resolve `path` against `root`.
pub fn get<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = match (current, key) {
            (Value::Object(map), PathKey::Field(name)) => map.get(name)?,
            (Value::Array(items), PathKey::Index(i)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk to the container that holds the last key of `path`.
fn container_mut<'a>(root: &'a mut Value, path: &Path, parent: &Path) -> Result<&'a mut Value> {
    let mut current = root;
    for (depth, key) in parent.iter().enumerate() {
        let here = path.prefix(depth + 1);
        current = match (current, key) {
            (Value::Object(map), PathKey::Field(name)) => {
                map.get_mut(name).ok_or_else(|| SyncError::not_found(path))?
            }
            (Value::Array(items), PathKey::Index(i)) => {
                items.get_mut(*i).ok_or_else(|| SyncError::not_found(path))?
            }
            (Value::Object(_), PathKey::Index(_)) => {
                return Err(SyncError::mismatch(&here, "list", "map"));
            }
            (Value::Array(_), PathKey::Field(_)) => {
                return Err(SyncError::mismatch(&here, "map", "list"));
            }
            (other, _) => {
                return Err(SyncError::mismatch(&here, "container", kind_name(other)));
            }
        };
    }
    Ok(current)
}

/// Apply one op in place. On error `root` may be partially modified; use
/// [`apply_patches`] for all-or-nothing semantics.
///
/// Returns the value that was removed or overwritten, if any.
pub fn apply_patch(root: &mut Value, op: &PatchOp) -> Result<Option<Value>> {
    let path = op.path();
    let Some((parent, last)) = path.split_last() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                Ok(Some(std::mem::replace(root, value.clone())))
            }
            PatchOp::Remove { .. } => Err(SyncError::not_found(path)),
        };
    };

    let container = container_mut(root, path, &parent)?;
    match (container, last) {
        (Value::Array(items), PathKey::Index(i)) => {
            let i = *i;
            match op {
                PatchOp::Add { value, .. } => {
                    if i > items.len() {
                        return Err(SyncError::not_found(path));
                    }
                    items.insert(i, value.clone());
                    Ok(None)
                }
                PatchOp::Replace { value, .. } => {
                    let slot = items.get_mut(i).ok_or_else(|| SyncError::not_found(path))?;
                    Ok(Some(std::mem::replace(slot, value.clone())))
                }
                PatchOp::Remove { .. } => {
                    if i >= items.len() {
                        return Err(SyncError::not_found(path));
                    }
                    Ok(Some(items.remove(i)))
                }
            }
        }
        (Value::Object(map), PathKey::Field(name)) => match op {
            PatchOp::Add { value, .. } => Ok(map.insert(name.clone(), value.clone())),
            PatchOp::Replace { value, .. } => {
                let slot = map.get_mut(name).ok_or_else(|| SyncError::not_found(path))?;
                Ok(Some(std::mem::replace(slot, value.clone())))
            }
            PatchOp::Remove { .. } => map
                .shift_remove(name)
                .map(Some)
                .ok_or_else(|| SyncError::not_found(path)),
        },
        (Value::Array(_), PathKey::Field(_)) => Err(SyncError::mismatch(path, "map", "list")),
        (Value::Object(_), PathKey::Index(_)) => Err(SyncError::mismatch(path, "list", "map")),
        (other, _) => Err(SyncError::mismatch(&parent, "container", kind_name(other))),
    }
}

/// Apply a batch atomically: either every op succeeds and `root` holds the
/// result, or `root` is left unchanged and the first error is returned.
pub fn apply_patches(root: &mut Value, ops: &[PatchOp]) -> Result<()> {
    let mut scratch = root.clone();
    for op in ops {
        apply_patch(&mut scratch, op)?;
    }
    *root = scratch;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    #[test]
    fn test_add_inserts_into_list() {
        let mut v = json!({"items": [1, 3]});
        apply_patch(&mut v, &PatchOp::add(path!["items", 1], 2)).unwrap();
        apply_patch(&mut v, &PatchOp::add(path!["items", 3], 4)).unwrap();
        assert_eq!(v, json!({"items": [1, 2, 3, 4]}));
    }

    #[test]
    fn test_add_past_end_is_not_found() {
        let mut v = json!([1]);
        let err = apply_patch(&mut v, &PatchOp::add(path![2], 0)).unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound { .. }));
    }

    #[test]
    fn test_replace_requires_existing_key() {
        let mut v = json!({"a": 1});
        let old = apply_patch(&mut v, &PatchOp::replace(path!["a"], 2)).unwrap();
        assert_eq!(old, Some(json!(1)));

        let err = apply_patch(&mut v, &PatchOp::replace(path!["b"], 2)).unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound { .. }));
    }

    #[test]
    fn test_remove_returns_old_value() {
        let mut v = json!({"a": {"b": [1, 2]}});
        let old = apply_patch(&mut v, &PatchOp::remove(path!["a", "b", 0])).unwrap();
        assert_eq!(old, Some(json!(1)));
        assert_eq!(v, json!({"a": {"b": [2]}}));
    }

    #[test]
    fn test_root_replace_and_remove() {
        let mut v = json!({"a": 1});
        apply_patch(&mut v, &PatchOp::replace(Path::root(), json!({"b": 2}))).unwrap();
        assert_eq!(v, json!({"b": 2}));

        let err = apply_patch(&mut v, &PatchOp::remove(Path::root())).unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound { .. }));
    }

    #[test]
    fn test_key_kind_mismatch() {
        let mut v = json!({"list": [1], "map": {}});
        let err = apply_patch(&mut v, &PatchOp::add(path!["list", "x"], 1)).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));

        let err = apply_patch(&mut v, &PatchOp::add(path!["map", 0], 1)).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));

        let err = apply_patch(&mut v, &PatchOp::add(path!["list", 0, "deep"], 1)).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut v = json!({"a": {"b": 1}});
        let before = v.clone();
        let err = apply_patches(
            &mut v,
            &[
                PatchOp::replace(path!["a", "b"], 5),
                PatchOp::remove(path!["a", "c", "x"]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound { .. }));
        assert_eq!(v, before);
    }

    #[test]
    fn test_list_delta_scenario() {
        let mut v = json!([10, 20, 30]);
        apply_patches(
            &mut v,
            &[PatchOp::remove(path![1]), PatchOp::add(path![1], 99)],
        )
        .unwrap();
        assert_eq!(v, json!([10, 99, 30]));
    }

    #[test]
    fn test_serde_shape() {
        let op = PatchOp::add(path!["todos", 0], json!({"text": "x"}));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            json!({"op": "add", "path": ["todos", 0], "value": {"text": "x"}})
        );
        let back: PatchOp = serde_json::from_value(json!({"op": "remove", "path": ["a"]})).unwrap();
        assert_eq!(back, PatchOp::remove(path!["a"]));
    }

    #[test]
    fn test_get_resolves_nested() {
        let v = json!({"a": [{"b": true}]});
        assert_eq!(get(&v, &path!["a", 0, "b"]), Some(&json!(true)));
        assert_eq!(get(&v, &path!["a", 1]), None);
        assert_eq!(get(&v, &path!["a", "x"]), None);
    }
}
