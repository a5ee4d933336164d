use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;

use crate::path::Path;

/// Unified error type for binding and translation operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Translation errors
    #[error("Malformed node at '{path}': {reason}")]
    MalformedNode { path: Path, reason: String },

    #[error("Path '{path}' does not resolve against the current shape")]
    PathNotFound { path: Path },

    #[error("Type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: Path,
        expected: String,
        found: String,
    },

    #[error("Node identifier '{id}' is claimed by more than one live subtree")]
    DuplicateIdentity { id: String },

    // Binding lifecycle errors
    #[error("Document root '{root}' is already bound; detach the existing binding first")]
    AlreadyBound { root: String },

    #[error("Binding is not active")]
    NotBound,

    // Collaborator errors
    /// For [`StateTree`](crate::tree::StateTree) implementors whose own
    /// validation refuses a batch; the binding breaks with this error.
    #[error("State tree rejected patches: {0}")]
    Tree(String),

    // Config errors
    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result type alias for binding operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        SyncError::MalformedNode {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        SyncError::PathNotFound { path: path.clone() }
    }

    pub(crate) fn mismatch(
        path: &Path,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        SyncError::TypeMismatch {
            path: path.clone(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of SyncError for hosts across an FFI/IPC boundary
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path, rendered as a JSON pointer (if applicable)
    pub path: Option<String>,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::MalformedNode { .. } => "MalformedNode",
            SyncError::PathNotFound { .. } => "PathNotFound",
            SyncError::TypeMismatch { .. } => "TypeMismatch",
            SyncError::DuplicateIdentity { .. } => "DuplicateIdentity",
            SyncError::AlreadyBound { .. } => "AlreadyBound",
            SyncError::NotBound => "NotBound",
            SyncError::Tree(_) => "Tree",
            SyncError::Config(_) => "Config",
        }
        .to_string();

        let path = match err {
            SyncError::MalformedNode { path, .. } => Some(path.to_string()),
            SyncError::PathNotFound { path } => Some(path.to_string()),
            SyncError::TypeMismatch { path, .. } => Some(path.to_string()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}
