//! Paths addressing positions inside a state tree or CRDT document.
//!
//! A [`Path`] is an ordered list of [`PathKey`]s: field names step into
//! objects / Y.Maps, integer indices step into arrays / Y.Arrays. The same
//! representation is used by both translation directions.
//!
//! Paths serialize as plain JSON arrays (`["todos", 0, "done"]`) so that the
//! field/index distinction survives the trip to a JS host, and display as
//! JSON pointers (`/todos/0/done`).

use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A single step in a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(untagged)]
pub enum PathKey {
    /// Position in an ordered container.
    Index(usize),
    /// Field of a keyed container.
    Field(String),
}

impl PathKey {
    /// Returns the index if this key addresses a list position.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathKey::Index(i) => Some(*i),
            PathKey::Field(_) => None,
        }
    }

    /// Returns the field name if this key addresses a map entry.
    pub fn as_field(&self) -> Option<&str> {
        match self {
            PathKey::Field(f) => Some(f),
            PathKey::Index(_) => None,
        }
    }
}

impl From<&str> for PathKey {
    fn from(value: &str) -> Self {
        PathKey::Field(value.to_string())
    }
}

impl From<String> for PathKey {
    fn from(value: String) -> Self {
        PathKey::Field(value)
    }
}

impl From<usize> for PathKey {
    fn from(value: usize) -> Self {
        PathKey::Index(value)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Index(i) => write!(f, "{}", i),
            PathKey::Field(name) => write!(f, "{}", name.replace('~', "~0").replace('/', "~1")),
        }
    }
}

/// An ordered sequence of keys. The empty path addresses the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(transparent)]
pub struct Path(Vec<PathKey>);

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns a new path with `key` appended.
    pub fn child(&self, key: impl Into<PathKey>) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.into());
        Self(keys)
    }

    /// Appends `key` in place.
    pub fn push(&mut self, key: impl Into<PathKey>) {
        self.0.push(key.into());
    }

    /// Splits into the container path and the last key.
    ///
    /// Returns `None` for the root path.
    pub fn split_last(&self) -> Option<(Path, &PathKey)> {
        let (last, parent) = self.0.split_last()?;
        Some((Path(parent.to_vec()), last))
    }

    /// The last key, if any.
    pub fn last(&self) -> Option<&PathKey> {
        self.0.last()
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path has no keys. Same as [`Path::is_root`].
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the keys in order.
    pub fn iter(&self) -> std::slice::Iter<'_, PathKey> {
        self.0.iter()
    }

    /// Borrow the keys as a slice.
    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    /// The prefix of the first `len` keys.
    pub fn prefix(&self, len: usize) -> Path {
        Path(self.0[..len.min(self.0.len())].to_vec())
    }

    /// Whether `self` starts with all the keys of `other`.
    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl From<Vec<PathKey>> for Path {
    fn from(keys: Vec<PathKey>) -> Self {
        Self(keys)
    }
}

impl FromIterator<PathKey> for Path {
    fn from_iter<T: IntoIterator<Item = PathKey>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a PathKey;
    type IntoIter = std::slice::Iter<'a, PathKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for key in &self.0 {
            write!(f, "/{}", key)?;
        }
        Ok(())
    }
}

/// Build a [`Path`] from a mix of field names and indices.
///
/// ```ignore
/// let p = path!["todos", 0, "done"];
/// ```
#[macro_export]
macro_rules! path {
    () => { $crate::path::Path::root() };
    ($($key:expr),+ $(,)?) => {
        $crate::path::Path::from(vec![$($crate::path::PathKey::from($key)),+])
    };
}
