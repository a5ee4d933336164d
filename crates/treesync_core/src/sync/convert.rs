//! Full-snapshot conversion between JSON values and yrs shared types.
//!
//! Objects become `Y.Map`s, arrays `Y.Array`s and primitives leaf values,
//! recursively. Typed nodes keep their reserved identifier/type fields
//! verbatim; the document has no other notion of identity.
//!
//! This is the expensive path. It runs when a binding is attached (or the
//! root is replaced wholesale) and to build the CRDT content of values added
//! by tree patches. Incremental changes coming *from* the document go through
//! [`CrdtEventTranslator`](super::CrdtEventTranslator) instead.
//!
//! # Numbers
//!
//! JSON integers are stored as `Any::BigInt` and JSON floats as `Any::Number`,
//! so both read back exactly: `2` stays `2` and `2.0` stays `2.0`. An
//! `Any::Number` written by another peer reads as a float even when it is
//! integral. Integers above `i64::MAX` have no exact representation and are
//! rejected by the schema check before anything is converted.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map as JsonMap, Number, Value};
use yrs::{Any, Array, ArrayPrelim, GetString, In, Map, MapPrelim, MapRef, Out, ReadTxn};

use crate::config::{BindingContext, BindingOptions};
use crate::error::{Result, SyncError};
use crate::patch::PatchOp;
use crate::path::Path;
use crate::schema::FieldKind;

/// Typed-node handles met while reading a subtree, keyed by identifier.
pub type HandleMap = HashMap<String, MapRef>;

/// Convert a JSON value into a yrs preliminary value, recursively.
///
/// The value is expected to have passed
/// [`SchemaRegistry::check`](crate::schema::SchemaRegistry::check).
pub fn value_to_in(value: &Value) -> In {
    match value {
        Value::Null => In::Any(Any::Null),
        Value::Bool(b) => In::Any(Any::Bool(*b)),
        Value::Number(n) => In::Any(number_to_any(n)),
        Value::String(s) => In::Any(Any::String(Arc::from(s.as_str()))),
        Value::Array(items) => In::Array(items.iter().map(value_to_in).collect::<ArrayPrelim>()),
        Value::Object(map) => In::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_in(v)))
                .collect::<MapPrelim>(),
        ),
    }
}

fn number_to_any(n: &Number) -> Any {
    match n.as_i64() {
        Some(i) => Any::BigInt(i),
        None => Any::Number(n.as_f64().unwrap_or_default()),
    }
}

/// Convert an embedded (non-shared) yrs value into JSON.
pub fn any_to_value(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::String(BASE64.encode(&bytes[..])),
        Any::Array(items) => Value::Array(items.iter().map(any_to_value).collect()),
        Any::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = JsonMap::new();
            for key in keys {
                out.insert(key.clone(), any_to_value(&map[key]));
            }
            Value::Object(out)
        }
    }
}

/// Read a yrs value into JSON without schema checks or decode hooks.
///
/// Maps are emitted with the reserved fields first and the remaining keys
/// sorted, so the result does not depend on the document's hash order.
/// Every typed map met on the way is recorded in `handles`.
pub fn read_out<T: ReadTxn>(
    txn: &T,
    out: &Out,
    path: &Path,
    options: &BindingOptions,
    handles: &mut HandleMap,
) -> Result<Value> {
    match out {
        Out::Any(any) => Ok(any_to_value(any)),
        Out::YText(text) => Ok(Value::String(text.get_string(txn))),
        Out::YArray(array) => {
            let mut items = Vec::with_capacity(array.len(txn) as usize);
            for (i, item) in array.iter(txn).enumerate() {
                items.push(read_out(txn, &item, &path.child(i), options, handles)?);
            }
            Ok(Value::Array(items))
        }
        Out::YMap(map) => read_map(txn, map, path, options, handles),
        _ => Err(SyncError::mismatch(
            path,
            "map, list or leaf value",
            "unsupported shared type",
        )),
    }
}

/// Read a `Y.Map` into a JSON object. See [`read_out`].
pub fn read_map<T: ReadTxn>(
    txn: &T,
    map: &MapRef,
    path: &Path,
    options: &BindingOptions,
    handles: &mut HandleMap,
) -> Result<Value> {
    let mut entries: Vec<(String, Out)> = map.iter(txn).map(|(k, v)| (k.to_string(), v)).collect();
    entries.sort_by(|(a, _), (b, _)| {
        let rank = |k: &str| {
            if k == options.id_field {
                0
            } else if k == options.type_field {
                1
            } else {
                2
            }
        };
        rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
    });

    let mut object = JsonMap::new();
    for (key, child) in entries {
        let child_path = path.child(key.as_str());
        let value = read_out(txn, &child, &child_path, options, handles)?;
        object.insert(key, value);
    }
    let value = Value::Object(object);

    if let Some((id, _)) = options.identity_of(&value, path)? {
        handles.insert(id.to_string(), map.clone());
    }
    Ok(value)
}

/// Converts whole snapshots between the tree and the document.
pub struct SnapshotConverter<'a> {
    ctx: &'a BindingContext,
}

impl<'a> SnapshotConverter<'a> {
    /// Create a converter using the context's schema, options and hooks.
    pub fn new(ctx: &'a BindingContext) -> Self {
        Self { ctx }
    }

    /// Validate a root snapshot and convert it into CRDT content.
    pub fn to_crdt(&self, snapshot: &Value) -> Result<In> {
        self.to_crdt_at(snapshot, &FieldKind::Typed, &Path::root())
    }

    /// Validate `value` against `kind` and convert it into CRDT content.
    pub fn to_crdt_at(&self, value: &Value, kind: &FieldKind, path: &Path) -> Result<In> {
        self.ctx.schema.check(value, kind, path, &self.ctx.options)?;
        Ok(value_to_in(value))
    }

    /// Convert a CRDT root (always a typed node) into a snapshot.
    pub fn to_snapshot<T: ReadTxn>(&self, txn: &T, out: &Out) -> Result<Value> {
        let mut handles = HandleMap::new();
        self.read_snapshot(txn, out, &mut handles)
    }

    /// Like [`to_snapshot`](Self::to_snapshot), also collecting typed-node
    /// handles for the identity registry.
    pub fn read_snapshot<T: ReadTxn>(
        &self,
        txn: &T,
        out: &Out,
        handles: &mut HandleMap,
    ) -> Result<Value> {
        let root = Path::root();
        let options = &self.ctx.options;
        let raw = read_out(txn, out, &root, options, handles)?;
        if options.identity_of(&raw, &root)?.is_none() {
            return Err(SyncError::malformed(
                &root,
                format!(
                    "document root lacks '{}' and '{}'",
                    options.id_field, options.type_field
                ),
            ));
        }
        let decoded = self.decode(raw, &root)?;
        self.ctx.schema.check(&decoded, &FieldKind::Typed, &root, options)?;
        Ok(decoded)
    }

    /// Apply decode hooks bottom-up.
    fn decode(&self, value: Value, path: &Path) -> Result<Value> {
        let options = &self.ctx.options;
        match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    out.push(self.decode(item, &path.child(i))?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut children = JsonMap::new();
                for (key, item) in map {
                    let child_path = path.child(key.as_str());
                    children.insert(key, self.decode(item, &child_path)?);
                }
                let node = Value::Object(children);
                let identity = options
                    .identity_of(&node, path)?
                    .map(|(id, tag)| (id.to_string(), tag.to_string()));
                let Some((id, tag)) = identity else {
                    return Ok(node);
                };
                let Some(hook) = self.ctx.decode_hook(&tag) else {
                    return Ok(node);
                };

                let Value::Object(fields) = hook(node)? else {
                    return Err(SyncError::malformed(
                        path,
                        format!("decode hook for '{}' did not return an object", tag),
                    ));
                };
                let mut restored = JsonMap::new();
                restored.insert(options.id_field.clone(), Value::String(id));
                restored.insert(options.type_field.clone(), Value::String(tag));
                for (key, item) in fields {
                    if !options.is_reserved(&key) {
                        restored.insert(key, item);
                    }
                }
                Ok(Value::Object(restored))
            }
            other => Ok(other),
        }
    }

    /// Give every object that has a type tag but no identifier a fresh one.
    ///
    /// Returns the `add` ops that bring the original tree in line. Existing
    /// identifiers are never touched.
    pub fn assign_missing_ids(&self, value: &mut Value) -> Vec<PatchOp> {
        let mut patches = Vec::new();
        self.assign_ids_at(value, &Path::root(), &mut patches);
        patches
    }

    fn assign_ids_at(&self, value: &mut Value, path: &Path, patches: &mut Vec<PatchOp>) {
        let options = &self.ctx.options;
        match value {
            Value::Object(map) => {
                if map.contains_key(&options.type_field) && !map.contains_key(&options.id_field) {
                    let id = Value::String(self.ctx.ids.next_id());
                    map.insert(options.id_field.clone(), id.clone());
                    patches.push(PatchOp::add(path.child(options.id_field.as_str()), id));
                }
                for (key, child) in map.iter_mut() {
                    self.assign_ids_at(child, &path.child(key.as_str()), patches);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    self.assign_ids_at(child, &path.child(i), patches);
                }
            }
            _ => {}
        }
    }
}

/// Overwrite the content of a root map with the fields of `value`.
pub fn write_root(
    txn: &mut yrs::TransactionMut,
    root: &MapRef,
    value: &Value,
    path: &Path,
) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| SyncError::mismatch(path, "map", crate::patch::kind_name(value)))?;
    let stale: Vec<String> = root
        .keys(txn)
        .map(str::to_string)
        .filter(|k| !object.contains_key(k))
        .collect();
    for key in stale {
        root.remove(txn, &key);
    }
    for (key, child) in object {
        root.insert(txn, key.as_str(), value_to_in(child));
    }
    Ok(())
}
