//! The tree-side contract.
//!
//! A binding talks to the local state tree only through [`StateTree`]: it
//! reads a full snapshot at attach time, listens to the patch stream, and
//! pushes translated remote changes back as patch batches.
//!
//! [`MemoryTree`] is an in-memory implementation holding a plain JSON value.
//! It behaves like a real observable tree in the way that matters for sync:
//! every successful mutation, whether made locally or applied from the
//! document, is announced to subscribers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use crate::error::Result;
use crate::patch::{PatchOp, apply_patches};

/// Callback receiving one patch batch.
pub type PatchListener = Arc<dyn Fn(&[PatchOp]) + Send + Sync>;

/// An unsubscribe capability. Dropping it unsubscribes as well.
#[must_use = "dropping a TreeSubscription unsubscribes immediately"]
pub struct TreeSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TreeSubscription {
    /// Wrap a cancellation closure.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving batches.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TreeSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TreeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Trait for the observable state tree a binding is attached to.
///
/// Implementations must deliver patch batches synchronously, in the order
/// the mutations happened, and must apply incoming batches all-or-nothing.
pub trait StateTree: Send + Sync {
    /// Full structured snapshot of the tree root.
    fn snapshot(&self) -> Value;

    /// Register a listener for patch batches produced by tree mutations.
    fn subscribe(&self, listener: PatchListener) -> TreeSubscription;

    /// Apply a batch atomically.
    ///
    /// Returns an error, leaving the tree unchanged, if any op fails.
    fn apply_patches(&self, patches: &[PatchOp]) -> Result<()>;
}

type ListenerList = RwLock<Vec<(u64, PatchListener)>>;

/// In-memory observable tree.
///
/// Clones share the same state and listeners.
#[derive(Clone, Default)]
pub struct MemoryTree {
    state: Arc<RwLock<Value>>,
    listeners: Arc<ListenerList>,
    next_listener: Arc<AtomicU64>,
}

impl MemoryTree {
    /// Create a tree holding `root`.
    pub fn new(root: Value) -> Self {
        Self {
            state: Arc::new(RwLock::new(root)),
            ..Default::default()
        }
    }

    /// Mutate the tree as the local application would, then announce the
    /// batch to subscribers.
    pub fn apply_local(&self, patches: &[PatchOp]) -> Result<()> {
        self.mutate(patches)
    }

    /// Number of active subscribers.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    fn mutate(&self, patches: &[PatchOp]) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            apply_patches(&mut state, patches)?;
        }
        self.notify(patches);
        Ok(())
    }

    fn notify(&self, patches: &[PatchOp]) {
        if patches.is_empty() {
            return;
        }
        // Snapshot the list so listeners may unsubscribe while being called.
        let listeners: Vec<PatchListener> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(patches);
        }
    }
}

impl StateTree for MemoryTree {
    fn snapshot(&self) -> Value {
        self.state.read().unwrap().clone()
    }

    fn subscribe(&self, listener: PatchListener) -> TreeSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().unwrap().push((id, listener));

        let weak: Weak<ListenerList> = Arc::downgrade(&self.listeners);
        TreeSubscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.write().unwrap().retain(|(lid, _)| *lid != id);
            }
        })
    }

    fn apply_patches(&self, patches: &[PatchOp]) -> Result<()> {
        self.mutate(patches)
    }
}

impl fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTree")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_local_mutation_notifies() {
        let tree = MemoryTree::new(json!({"n": 1}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = tree.subscribe(Arc::new(move |batch: &[PatchOp]| {
            seen_clone.lock().unwrap().extend_from_slice(batch);
        }));

        tree.apply_local(&[PatchOp::replace(path!["n"], 2)]).unwrap();

        assert_eq!(tree.snapshot(), json!({"n": 2}));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_batch_is_silent_and_atomic() {
        let tree = MemoryTree::new(json!({"n": 1}));
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = Arc::clone(&calls);
        let _sub = tree.subscribe(Arc::new(move |_: &[PatchOp]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let result = tree.apply_patches(&[
            PatchOp::replace(path!["n"], 5),
            PatchOp::remove(path!["missing"]),
        ]);

        assert!(result.is_err());
        assert_eq!(tree.snapshot(), json!({"n": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let tree = MemoryTree::new(json!({}));
        let sub = tree.subscribe(Arc::new(|_: &[PatchOp]| {}));
        let dropped = tree.subscribe(Arc::new(|_: &[PatchOp]| {}));
        assert_eq!(tree.listener_count(), 2);

        sub.unsubscribe();
        drop(dropped);
        assert_eq!(tree.listener_count(), 0);
    }
}
