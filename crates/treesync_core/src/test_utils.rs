//! Test utilities for treesync_core
//!
//! Shared fixtures: a small todo-list tree and a context whose schema
//! describes it.

use serde_json::{Value, json};

use crate::config::BindingContext;
use crate::schema::{FieldKind, NodeSchema, SchemaRegistry};

/// Schema for the `todoList` / `todo` fixture types.
pub fn todo_schema() -> SchemaRegistry {
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

/// A context with the todo schema and default options.
pub fn test_context() -> BindingContext {
    BindingContext::default().with_schema(todo_schema())
}

/// A todo list with two todos and a tag map.
pub fn sample_tree() -> Value {
    json!({
        "$modelId": "list-1",
        "$modelType": "todoList",
        "title": "Groceries",
        "todos": [
            {"$modelId": "t-1", "$modelType": "todo", "text": "milk", "done": false},
            {"$modelId": "t-2", "$modelType": "todo", "text": "bread", "done": true}
        ],
        "tags": {"shop": "corner", "day": "saturday"}
    })
}
