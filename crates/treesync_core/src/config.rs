//! Binding configuration and context.
//!
//! [`BindingOptions`] holds the behavioural flags of a binding and can be
//! loaded from TOML. [`BindingContext`] bundles the options with the
//! collaborators a binding needs for its whole lifetime: the identifier
//! generator, the schema registry and any per-type decode hooks. A context is
//! passed into [`SyncController::attach`](crate::sync::SyncController::attach);
//! nothing here is process-global.
//!
//! # Example
//!
//! ```ignore
//! use treesync_core::config::{BindingContext, BindingOptions};
//!
//! let options = BindingOptions::from_toml_str(r#"
//!     id_field = "id"
//!     type_field = "kind"
//!     strict_schema = true
//! "#)?;
//! let ctx = BindingContext::new(options).with_schema(schema);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::path::Path;
use crate::schema::SchemaRegistry;

/// Default name of the reserved identifier field.
pub const DEFAULT_ID_FIELD: &str = "$modelId";

/// Default name of the reserved type-tag field.
pub const DEFAULT_TYPE_FIELD: &str = "$modelType";

/// `BindingOptions` is the part of a binding the host can configure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingOptions {
    /// Reserved field holding a typed node's stable identifier
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Reserved field holding a typed node's type tag
    #[serde(default = "default_type_field")]
    pub type_field: String,

    /// Reject undeclared fields and unregistered type tags
    #[serde(default)]
    pub strict_schema: bool,

    /// Emit a brand-new typed node arriving from the document as one `add`
    /// carrying the whole subtree, instead of one op per descendant
    #[serde(default = "default_true")]
    pub first_sight_snapshots: bool,
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

fn default_type_field() -> String {
    DEFAULT_TYPE_FIELD.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            type_field: default_type_field(),
            strict_schema: false,
            first_sight_snapshots: true,
        }
    }
}

impl BindingOptions {
    /// Parse options from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Whether `name` is one of the two reserved fields.
    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.id_field || name == self.type_field
    }

    /// Read the identity of a typed node.
    ///
    /// Returns `Ok(None)` for anything that is not an object carrying the
    /// reserved fields, and `MalformedNode` if only one of them is present or
    /// either is not a non-empty string.
    pub fn identity_of<'a>(
        &self,
        value: &'a Value,
        path: &Path,
    ) -> Result<Option<(&'a str, &'a str)>> {
        let Some(map) = value.as_object() else {
            return Ok(None);
        };
        match (map.get(&self.id_field), map.get(&self.type_field)) {
            (None, None) => Ok(None),
            (Some(id), Some(tag)) => match (id.as_str(), tag.as_str()) {
                (Some(id), Some(tag)) if !id.is_empty() && !tag.is_empty() => Ok(Some((id, tag))),
                _ => Err(SyncError::malformed(
                    path,
                    format!(
                        "'{}' and '{}' must be non-empty strings",
                        self.id_field, self.type_field
                    ),
                )),
            },
            (None, Some(_)) => Err(SyncError::malformed(
                path,
                format!("missing identifier field '{}'", self.id_field),
            )),
            (Some(_), None) => Err(SyncError::malformed(
                path,
                format!("missing type field '{}'", self.type_field),
            )),
        }
    }
}

/// Source of fresh node identifiers.
pub trait IdGenerator: Send + Sync {
    /// Produce an identifier never handed out before by this generator.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-N` identifiers, for tests and reproducible fixtures.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    /// Start counting at 1 with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

/// Custom decoding for one type tag, applied only while reconciling a full
/// snapshot from the document. Receives the raw node object and returns its
/// domain fields; reserved fields are restored afterwards.
pub type DecodeHook = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Everything a binding needs besides the two sides it connects.
#[derive(Clone)]
pub struct BindingContext {
    /// Behavioural flags
    pub options: BindingOptions,
    /// Identifier source for nodes created without one
    pub ids: Arc<dyn IdGenerator>,
    /// Field kinds per type tag
    pub schema: Arc<SchemaRegistry>,
    hooks: HashMap<String, DecodeHook>,
}

impl BindingContext {
    /// Create a context with UUID identifiers and an empty schema.
    pub fn new(options: BindingOptions) -> Self {
        Self {
            options,
            ids: Arc::new(UuidGenerator),
            schema: Arc::new(SchemaRegistry::new()),
            hooks: HashMap::new(),
        }
    }

    /// Use a different identifier generator (builder pattern).
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Use the given schema registry (builder pattern).
    pub fn with_schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Install a decode hook for `type_tag` (builder pattern).
    pub fn with_decode_hook<F>(mut self, type_tag: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.hooks.insert(type_tag.into(), Arc::new(hook));
        self
    }

    /// The decode hook registered for `type_tag`, if any.
    pub fn decode_hook(&self, type_tag: &str) -> Option<&DecodeHook> {
        self.hooks.get(type_tag)
    }

    /// Build a fresh typed node with a newly generated identifier.
    pub fn new_node(&self, type_tag: &str) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(self.options.id_field.clone(), Value::String(self.ids.next_id()));
        map.insert(self.options.type_field.clone(), Value::String(type_tag.to_string()));
        Value::Object(map)
    }
}

impl Default for BindingContext {
    fn default() -> Self {
        Self::new(BindingOptions::default())
    }
}

impl fmt::Debug for BindingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingContext")
            .field("options", &self.options)
            .field("schema_types", &self.schema.len())
            .field("decode_hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let opts = BindingOptions::default();
        assert_eq!(opts.id_field, "$modelId");
        assert_eq!(opts.type_field, "$modelType");
        assert!(opts.first_sight_snapshots);
        assert!(!opts.strict_schema);
    }

    #[test]
    fn test_from_toml_partial() {
        let opts =
            BindingOptions::from_toml_str("id_field = \"id\"\nstrict_schema = true\n").unwrap();
        assert_eq!(opts.id_field, "id");
        assert_eq!(opts.type_field, "$modelType");
        assert!(opts.strict_schema);
        assert!(opts.first_sight_snapshots);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = BindingOptions::from_toml_str("strict_schema = \"yes\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_identity_of() {
        let opts = BindingOptions::default();
        let path = Path::root();

        let typed = json!({"$modelId": "a", "$modelType": "t", "x": 1});
        assert_eq!(opts.identity_of(&typed, &path).unwrap(), Some(("a", "t")));

        assert_eq!(opts.identity_of(&json!({"x": 1}), &path).unwrap(), None);
        assert_eq!(opts.identity_of(&json!([1]), &path).unwrap(), None);

        let half = json!({"$modelType": "t"});
        assert!(matches!(
            opts.identity_of(&half, &path),
            Err(SyncError::MalformedNode { .. })
        ));

        let numeric = json!({"$modelId": 7, "$modelType": "t"});
        assert!(matches!(
            opts.identity_of(&numeric, &path),
            Err(SyncError::MalformedNode { .. })
        ));
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new("n");
        assert_eq!(ids.next_id(), "n-1");
        assert_eq!(ids.next_id(), "n-2");
    }

    #[test]
    fn test_new_node_uses_generator() {
        let ctx = BindingContext::default().with_ids(Arc::new(SequentialIds::new("todo")));
        let node = ctx.new_node("todo");
        assert_eq!(node, json!({"$modelId": "todo-1", "$modelType": "todo"}));
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
