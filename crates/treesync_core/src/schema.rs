//! Explicit schema for typed nodes.
//!
//! Each type tag maps to a [`NodeSchema`] listing its fields and their
//! [`FieldKind`]. The registry is consulted when snapshots are converted and
//! when tree patches are translated, so that a list field never silently
//! becomes a map on the CRDT side (or the other way round).
//!
//! Fields a schema doesn't declare, and tags no schema is registered for, are
//! accepted as [`FieldKind::Any`] unless the binding runs with
//! `strict_schema` enabled.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BindingOptions;
use crate::error::{Result, SyncError};
use crate::patch::kind_name;
use crate::path::{Path, PathKey};

/// The closed set of node kinds a field may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "camelCase")]
pub enum FieldKind {
    /// Number, string, boolean or null.
    Primitive,
    /// Ordered container of the inner kind.
    List(Box<FieldKind>),
    /// Keyed container (not a typed node) with values of the inner kind.
    Map(Box<FieldKind>),
    /// A typed node carrying identifier and type tag.
    Typed,
    /// Anything; typed nodes found inside are still checked.
    Any,
}

impl FieldKind {
    /// `List(inner)` shorthand.
    pub fn list(inner: FieldKind) -> Self {
        FieldKind::List(Box::new(inner))
    }

    /// `Map(inner)` shorthand.
    pub fn map(inner: FieldKind) -> Self {
        FieldKind::Map(Box::new(inner))
    }
}

/// Field layout of one type tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    /// Declared fields, in declaration order.
    pub fields: IndexMap<String, FieldKind>,
}

impl NodeSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field (builder pattern).
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }
}

/// Registry from type tags to field schemas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    types: HashMap<String, NodeSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for `type_tag` (builder pattern).
    pub fn with_type(mut self, type_tag: impl Into<String>, schema: NodeSchema) -> Self {
        self.register(type_tag, schema);
        self
    }

    /// Register or replace the schema for `type_tag`.
    pub fn register(&mut self, type_tag: impl Into<String>, schema: NodeSchema) {
        self.types.insert(type_tag.into(), schema);
    }

    /// Look up the schema for `type_tag`.
    pub fn get(&self, type_tag: &str) -> Option<&NodeSchema> {
        self.types.get(type_tag)
    }

    /// Number of registered type tags.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type tags are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Kind of a field of a node with the given tag.
    fn field_kind(
        &self,
        type_tag: &str,
        field: &str,
        path: &Path,
        options: &BindingOptions,
    ) -> Result<FieldKind> {
        if field == options.id_field || field == options.type_field {
            return Ok(FieldKind::Primitive);
        }
        match self.get(type_tag) {
            Some(schema) => match schema.fields.get(field) {
                Some(kind) => Ok(kind.clone()),
                None if options.strict_schema => Err(SyncError::mismatch(
                    path,
                    format!("a field declared by '{}'", type_tag),
                    format!("undeclared field '{}'", field),
                )),
                None => Ok(FieldKind::Any),
            },
            None if options.strict_schema => Err(SyncError::malformed(
                path,
                format!("no schema registered for type '{}'", type_tag),
            )),
            None => Ok(FieldKind::Any),
        }
    }

    /// Determine the kind expected at `path` inside `root`.
    ///
    /// The root is always a typed node. `root` must already contain every
    /// container along `path` (the last key itself need not exist).
    pub fn kind_at(
        &self,
        root: &Value,
        path: &Path,
        options: &BindingOptions,
    ) -> Result<FieldKind> {
        let mut kind = FieldKind::Typed;
        let mut current = Some(root);
        for (depth, key) in path.iter().enumerate() {
            let here = path.prefix(depth + 1);
            kind = match (&kind, key) {
                (FieldKind::Typed, PathKey::Field(name)) => {
                    let node = current.ok_or_else(|| SyncError::not_found(&here))?;
                    let tag = node
                        .get(options.type_field.as_str())
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            SyncError::malformed(&path.prefix(depth), "typed node lacks a type tag")
                        })?;
                    self.field_kind(tag, name, &here, options)?
                }
                (FieldKind::List(inner), PathKey::Index(_)) => (**inner).clone(),
                (FieldKind::Map(inner), PathKey::Field(_)) => (**inner).clone(),
                (FieldKind::Any, _) => FieldKind::Any,
                (FieldKind::List(_), PathKey::Field(_)) => {
                    return Err(SyncError::mismatch(&here, "list index", "field name"));
                }
                (FieldKind::Map(_) | FieldKind::Typed, PathKey::Index(_)) => {
                    return Err(SyncError::mismatch(&here, "field name", "list index"));
                }
                (FieldKind::Primitive, _) => {
                    return Err(SyncError::mismatch(&here, "container", "primitive"));
                }
            };
            current = current.and_then(|v| match (v, key) {
                (Value::Object(map), PathKey::Field(name)) => map.get(name),
                (Value::Array(items), PathKey::Index(i)) => items.get(*i),
                _ => None,
            });
        }
        Ok(kind)
    }

    /// Check `value` against `kind`, recursing into containers.
    pub fn check(
        &self,
        value: &Value,
        kind: &FieldKind,
        path: &Path,
        options: &BindingOptions,
    ) -> Result<()> {
        match kind {
            FieldKind::Primitive => {
                if value.is_array() || value.is_object() {
                    return Err(SyncError::mismatch(path, "primitive", kind_name(value)));
                }
                check_leaf(value, path)
            }
            FieldKind::List(inner) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| SyncError::mismatch(path, "list", kind_name(value)))?;
                for (i, item) in items.iter().enumerate() {
                    self.check(item, inner, &path.child(i), options)?;
                }
                Ok(())
            }
            FieldKind::Map(inner) => {
                let map = value
                    .as_object()
                    .ok_or_else(|| SyncError::mismatch(path, "map", kind_name(value)))?;
                if options.identity_of(value, path)?.is_some() {
                    return Err(SyncError::mismatch(path, "plain map", "typed node"));
                }
                for (key, item) in map {
                    self.check(item, inner, &path.child(key.as_str()), options)?;
                }
                Ok(())
            }
            FieldKind::Typed => {
                let map = value
                    .as_object()
                    .ok_or_else(|| SyncError::mismatch(path, "typed node", kind_name(value)))?;
                let (_, tag) = options
                    .identity_of(value, path)?
                    .ok_or_else(|| SyncError::malformed(path, "missing identifier and type tag"))?;
                if options.strict_schema && self.get(tag).is_none() {
                    return Err(SyncError::malformed(
                        path,
                        format!("no schema registered for type '{}'", tag),
                    ));
                }
                for (key, item) in map {
                    let field_kind = self.field_kind(tag, key, &path.child(key.as_str()), options)?;
                    self.check(item, &field_kind, &path.child(key.as_str()), options)?;
                }
                Ok(())
            }
            FieldKind::Any => match value {
                Value::Object(map) => {
                    if options.identity_of(value, path)?.is_some() {
                        return self.check(value, &FieldKind::Typed, path, options);
                    }
                    for (key, item) in map {
                        self.check(item, &FieldKind::Any, &path.child(key.as_str()), options)?;
                    }
                    Ok(())
                }
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        self.check(item, &FieldKind::Any, &path.child(i), options)?;
                    }
                    Ok(())
                }
                _ => check_leaf(value, path),
            },
        }
    }
}

/// Integers above `i64::MAX` cannot be stored in the document exactly.
fn check_leaf(value: &Value, path: &Path) -> Result<()> {
    match value {
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => Err(SyncError::mismatch(
            path,
            "integer within the i64 range",
            format!("integer {}", n),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with_type(
                "todoList",
                NodeSchema::new()
                    .field("title", FieldKind::Primitive)
                    .field("todos", FieldKind::list(FieldKind::Typed))
                    .field("tags", FieldKind::map(FieldKind::Primitive)),
            )
            .with_type(
                "todo",
                NodeSchema::new()
                    .field("text", FieldKind::Primitive)
                    .field("done", FieldKind::Primitive),
            )
    }

    fn sample() -> Value {
        json!({
            "$modelId": "list-1",
            "$modelType": "todoList",
            "title": "Groceries",
            "todos": [
                {"$modelId": "t-1", "$modelType": "todo", "text": "milk", "done": false}
            ],
            "tags": {"shop": "corner"}
        })
    }

    #[test]
    fn test_valid_tree_passes() {
        let opts = BindingOptions::default();
        registry()
            .check(&sample(), &FieldKind::Typed, &Path::root(), &opts)
            .unwrap();
    }

    #[test]
    fn test_list_field_given_map_is_mismatch() {
        let opts = BindingOptions::default();
        let mut v = sample();
        v["todos"] = json!({});
        let err = registry()
            .check(&v, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }

    #[test]
    fn test_half_identified_node_is_malformed() {
        let opts = BindingOptions::default();
        let mut v = sample();
        v["todos"][0].as_object_mut().unwrap().remove("$modelType");
        let err = registry()
            .check(&v, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedNode { .. }));
    }

    #[test]
    fn test_kind_at_walks_schema() {
        let opts = BindingOptions::default();
        let reg = registry();
        let v = sample();
        assert_eq!(
            reg.kind_at(&v, &path!["todos"], &opts).unwrap(),
            FieldKind::list(FieldKind::Typed)
        );
        assert_eq!(reg.kind_at(&v, &path!["todos", 3], &opts).unwrap(), FieldKind::Typed);
        assert_eq!(
            reg.kind_at(&v, &path!["todos", 0, "done"], &opts).unwrap(),
            FieldKind::Primitive
        );
        assert_eq!(reg.kind_at(&v, &path!["tags", "new"], &opts).unwrap(), FieldKind::Primitive);
        assert_eq!(reg.kind_at(&v, &path!["extra", 0], &opts).unwrap(), FieldKind::Any);

        let err = reg.kind_at(&v, &path!["todos", "x"], &opts).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }

    #[test]
    fn test_integer_above_i64_is_mismatch() {
        let opts = BindingOptions::default();
        let mut v = sample();
        v["todos"][0]["done"] = json!(u64::MAX);
        let err = registry()
            .check(&v, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));

        v["todos"][0]["done"] = json!(i64::MAX as u64);
        registry()
            .check(&v, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap();
    }

    #[test]
    fn test_strict_schema_rejects_unknown() {
        let opts = BindingOptions {
            strict_schema: true,
            ..Default::default()
        };
        let mut v = sample();
        v["unknown"] = json!(1);
        let err = registry()
            .check(&v, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));

        let lone = json!({"$modelId": "x", "$modelType": "mystery"});
        let err = registry()
            .check(&lone, &FieldKind::Typed, &Path::root(), &opts)
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedNode { .. }));
    }

    #[test]
    fn test_schema_loads_from_json() {
        let schema: NodeSchema = serde_json::from_value(json!({
            "fields": {
                "items": {"kind": "list", "of": {"kind": "typed"}},
                "name": {"kind": "primitive"}
            }
        }))
        .unwrap();
        assert_eq!(schema.fields["items"], FieldKind::list(FieldKind::Typed));
    }
}
