//! Binding lifecycle and bidirectional sync.
//!
//! [`SyncController`] owns one binding between a [`StateTree`] and a named
//! root map of a yrs [`Doc`]. It reconciles the two at attach time, then
//! forwards batches in both directions until it is detached.
//!
//! # Echo suppression
//!
//! Writing a local batch into the document makes yrs call our own deep
//! observer back, synchronously, when the transaction commits. Applying a
//! remote batch to the tree does the same with the tree listener. Two flags
//! break those loops:
//!
//! - `suppress_echo` is set while a local batch is written to the document;
//!   document batches seen meanwhile are discarded.
//! - `applying_remote` is set while a remote batch is applied to the tree;
//!   tree batches seen meanwhile are ignored.
//!
//! Both are checked before any lock is taken, since the re-entrant call
//! happens in the middle of a batch.
//!
//! # Locking
//!
//! A batch is staged under the state lock, which is released before the
//! other side is written and taken again to commit. Host listeners and
//! observers that run during the write may therefore query the controller.
//! A separate batch lock keeps batches from different threads apart.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use yrs::types::Events;
use yrs::{DeepObservable, Doc, Map, MapRef, Out, Subscription, Transact, TransactionMut};

use super::convert::{HandleMap, SnapshotConverter, read_map, write_root};
use super::events::{CrdtEventTranslator, collect_events};
use super::identity::{IdentityRegistry, typed_nodes};
use super::translate::{StagedBatch, TreePatchTranslator, describe, stage_patches};
use crate::config::BindingContext;
use crate::error::{Result, SerializableError, SyncError};
use crate::patch::PatchOp;
use crate::path::Path;
use crate::tree::{StateTree, TreeSubscription};

/// Lifecycle state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub enum BindingState {
    /// No binding; nothing is synced.
    Unbound,
    /// Initial snapshot reconciliation in progress.
    Reconciling,
    /// Steady-state bidirectional sync.
    Bound,
    /// A batch failed to translate; every further batch is dropped until
    /// the binding is detached.
    Broken,
}

/// Batch counters of a binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct BindingStats {
    /// Tree batches written to the document.
    pub local_batches: u64,
    /// Document batches applied to the tree.
    pub remote_batches: u64,
    /// Document batches discarded as echoes of our own writes.
    pub suppressed_batches: u64,
    /// Batches that failed to translate.
    pub rejected_batches: u64,
}

#[derive(Default)]
struct Counters {
    local: AtomicU64,
    remote: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BindingStats {
        BindingStats {
            local_batches: self.local.load(Ordering::Relaxed),
            remote_batches: self.remote.load(Ordering::Relaxed),
            suppressed_batches: self.suppressed.load(Ordering::Relaxed),
            rejected_batches: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Document roots currently bound in this process, as `client_id/root`.
fn claims() -> &'static Mutex<HashSet<String>> {
    static CLAIMS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CLAIMS.get_or_init(|| Mutex::new(HashSet::new()))
}

struct Inner {
    state: BindingState,
    mirror: Value,
    registry: IdentityRegistry<MapRef>,
    last_error: Option<SerializableError>,
}

struct Shared {
    ctx: BindingContext,
    doc: Doc,
    root: MapRef,
    tree: Arc<dyn StateTree>,
    inner: Mutex<Inner>,
    /// Serializes batches; never held by the read accessors.
    batch: Mutex<()>,
    suppress_echo: AtomicBool,
    applying_remote: AtomicBool,
    counters: Counters,
}

impl Shared {
    /// Move to `Broken`, keeping the error for [`SyncController::last_error`].
    fn fail(&self, inner: &mut Inner, err: SyncError) {
        log::error!("[SyncController] Batch rejected, binding broken: {}", err);
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        inner.state = BindingState::Broken;
        inner.last_error = Some(err.to_serializable());
    }

    /// Tree → document.
    fn on_tree_batch(&self, patches: &[PatchOp]) {
        if self.applying_remote.load(Ordering::SeqCst) {
            return;
        }
        let _batch = self.batch.lock().unwrap();
        let translator = TreePatchTranslator::new(&self.ctx);
        let staged = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != BindingState::Bound {
                log::debug!(
                    "[SyncController] Dropping tree batch of {} ops in state {:?}",
                    patches.len(),
                    inner.state
                );
                return;
            }
            match translator.stage(&inner.mirror, patches, &inner.registry) {
                Ok(staged) => staged,
                Err(err) => {
                    self.fail(&mut inner, err);
                    return;
                }
            }
        };

        // Document observers run on commit, outside the state lock.
        self.suppress_echo.store(true, Ordering::SeqCst);
        let written = {
            let mut txn = self.doc.transact_mut();
            translator.write(&mut txn, &self.root, patches, &staged.delta.added)
        };
        self.suppress_echo.store(false, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        self.commit(&mut inner, staged, written, &self.counters.local);
        if inner.state == BindingState::Bound {
            log::debug!(
                "[SyncController] Wrote tree batch: {}",
                patches.iter().map(describe).collect::<Vec<_>>().join(", ")
            );
        }
    }

    /// Document → tree.
    fn on_doc_events(&self, txn: &TransactionMut, events: &Events) {
        if self.suppress_echo.load(Ordering::SeqCst) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            log::debug!("[SyncController] Skipping echo of our own transaction");
            return;
        }
        let _batch = self.batch.lock().unwrap();
        let (patches, staged, handles) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != BindingState::Bound {
                log::debug!(
                    "[SyncController] Dropping document batch in state {:?}",
                    inner.state
                );
                return;
            }
            match self.translate_remote(&inner, txn, events) {
                Ok(translated) => translated,
                Err(err) => {
                    self.fail(&mut inner, err);
                    return;
                }
            }
        };
        if patches.is_empty() {
            return;
        }

        // Tree listeners may call back into the controller.
        self.applying_remote.store(true, Ordering::SeqCst);
        let applied = self.tree.apply_patches(&patches);
        self.applying_remote.store(false, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        self.commit(&mut inner, staged, applied.map(|()| handles), &self.counters.remote);
        if inner.state == BindingState::Bound {
            log::debug!(
                "[SyncController] Applied document batch: {}",
                patches.iter().map(describe).collect::<Vec<_>>().join(", ")
            );
        }
    }

    /// Second half of a batch, after the other side was written: adopt the
    /// staged mirror and registry delta, or break the binding.
    fn commit(
        &self,
        inner: &mut Inner,
        staged: StagedBatch,
        written: Result<HandleMap>,
        counter: &AtomicU64,
    ) {
        if inner.state != BindingState::Bound {
            log::debug!("[SyncController] Binding left Bound during the batch, discarding it");
            return;
        }
        let result = written.and_then(|handles| {
            inner
                .registry
                .commit(&staged.delta, |id| handles.get(id).cloned())
        });
        match result {
            Ok(()) => {
                inner.mirror = staged.mirror;
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.fail(inner, err),
        }
    }

    fn translate_remote(
        &self,
        inner: &Inner,
        txn: &TransactionMut,
        events: &Events,
    ) -> Result<(Vec<PatchOp>, StagedBatch, HandleMap)> {
        let mut handles = HandleMap::new();
        let crdt_events = collect_events(txn, events, &self.ctx.options, &mut handles)?;
        let patches =
            CrdtEventTranslator::new(&self.ctx.options, &inner.registry).translate(&crdt_events)?;
        let staged = stage_patches(&self.ctx, &inner.mirror, &patches, &inner.registry)?;
        Ok((patches, staged, handles))
    }
}

/// A live binding between a state tree and a document root map.
///
/// Dropping the controller detaches it.
pub struct SyncController {
    shared: Arc<Shared>,
    root_name: String,
    claim: Option<String>,
    tree_subscription: Option<TreeSubscription>,
    doc_subscription: Option<Subscription>,
}

impl SyncController {
    /// Bind `tree` to the root map `root_name` of `doc`.
    ///
    /// An empty root adopts the tree's state (after giving every typed node
    /// without an identifier a fresh one). A non-empty root is the source of
    /// truth: the tree is replaced with its snapshot. On error nothing has
    /// been written to either side.
    pub fn attach(
        tree: Arc<dyn StateTree>,
        doc: &Doc,
        root_name: &str,
        ctx: BindingContext,
    ) -> Result<Self> {
        let claim = format!("{}/{}", doc.client_id(), root_name);
        if !claims().lock().unwrap().insert(claim.clone()) {
            return Err(SyncError::AlreadyBound {
                root: root_name.to_string(),
            });
        }

        match Self::reconcile(tree.as_ref(), doc, root_name, &ctx) {
            Ok((root, mirror, registry)) => {
                log::info!(
                    "[SyncController] Bound root '{}' ({} typed nodes)",
                    root_name,
                    registry.len()
                );
                let shared = Arc::new(Shared {
                    ctx,
                    doc: doc.clone(),
                    root,
                    tree,
                    inner: Mutex::new(Inner {
                        state: BindingState::Bound,
                        mirror,
                        registry,
                        last_error: None,
                    }),
                    batch: Mutex::new(()),
                    suppress_echo: AtomicBool::new(false),
                    applying_remote: AtomicBool::new(false),
                    counters: Counters::default(),
                });
                let (tree_subscription, doc_subscription) = Self::subscribe(&shared);
                Ok(Self {
                    shared,
                    root_name: root_name.to_string(),
                    claim: Some(claim),
                    tree_subscription: Some(tree_subscription),
                    doc_subscription: Some(doc_subscription),
                })
            }
            Err(err) => {
                log::warn!("[SyncController] Attach to '{}' failed: {}", root_name, err);
                claims().lock().unwrap().remove(&claim);
                Err(err)
            }
        }
    }

    /// Initial reconciliation. Validates fully before writing to either side.
    fn reconcile(
        tree: &dyn StateTree,
        doc: &Doc,
        root_name: &str,
        ctx: &BindingContext,
    ) -> Result<(MapRef, Value, IdentityRegistry<MapRef>)> {
        let root = doc.get_or_insert_map(root_name);
        let converter = SnapshotConverter::new(ctx);
        let options = &ctx.options;
        let mut handles = HandleMap::new();

        let is_empty = root.len(&doc.transact()) == 0;
        let mirror = if is_empty {
            log::debug!("[SyncController] Root '{}' is empty, adopting tree state", root_name);
            let mut snapshot = tree.snapshot();
            let id_patches = converter.assign_missing_ids(&mut snapshot);
            converter.to_crdt(&snapshot)?;
            check_unique(&snapshot, ctx)?;

            tree.apply_patches(&id_patches)?;
            let mut txn = doc.transact_mut();
            write_root(&mut txn, &root, &snapshot, &Path::root())?;
            read_map(&txn, &root, &Path::root(), options, &mut handles)?;
            snapshot
        } else {
            log::debug!(
                "[SyncController] Root '{}' has content, adopting document state",
                root_name
            );
            let snapshot = {
                let txn = doc.transact();
                converter.read_snapshot(&txn, &Out::YMap(root.clone()), &mut handles)?
            };
            check_unique(&snapshot, ctx)?;
            tree.apply_patches(&[PatchOp::replace(Path::root(), snapshot.clone())])?;
            snapshot
        };

        let mut registry = IdentityRegistry::new();
        for (id, type_tag) in typed_nodes(&mirror, &Path::root(), options)? {
            match handles.get(&id) {
                Some(handle) => registry.register(&id, &type_tag, handle.clone())?,
                None => log::warn!("[SyncController] No CRDT handle for node '{}'", id),
            }
        }
        Ok((root, mirror, registry))
    }

    fn subscribe(shared: &Arc<Shared>) -> (TreeSubscription, Subscription) {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let tree_subscription = shared.tree.subscribe(Arc::new(move |patches: &[PatchOp]| {
            if let Some(shared) = weak.upgrade() {
                shared.on_tree_batch(patches);
            }
        }));

        let weak: Weak<Shared> = Arc::downgrade(shared);
        let doc_subscription = shared.root.observe_deep(move |txn, events| {
            if let Some(shared) = weak.upgrade() {
                shared.on_doc_events(txn, events);
            }
        });
        (tree_subscription, doc_subscription)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BindingState {
        self.shared.inner.lock().unwrap().state
    }

    /// Batch counters since attach.
    pub fn stats(&self) -> BindingStats {
        self.shared.counters.snapshot()
    }

    /// Name of the bound document root.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Number of typed nodes with a live CRDT handle.
    pub fn registry_len(&self) -> usize {
        self.shared.inner.lock().unwrap().registry.len()
    }

    /// Whether `id` is registered.
    pub fn contains_node(&self, id: &str) -> bool {
        self.shared.inner.lock().unwrap().registry.contains(id)
    }

    /// The error that broke the binding, if any.
    pub fn last_error(&self) -> Option<SerializableError> {
        self.shared.inner.lock().unwrap().last_error.clone()
    }

    /// The state both sides last agreed on.
    pub fn mirror(&self) -> Result<Value> {
        let inner = self.shared.inner.lock().unwrap();
        match inner.state {
            BindingState::Unbound => Err(SyncError::NotBound),
            _ => Ok(inner.mirror.clone()),
        }
    }

    /// Unsubscribe from both sides and release the document root.
    ///
    /// Works from any state and may be called more than once.
    pub fn detach(&mut self) {
        if let Some(subscription) = self.tree_subscription.take() {
            subscription.unsubscribe();
        }
        self.doc_subscription.take();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.registry.clear();
            inner.state = BindingState::Unbound;
        }
        if let Some(claim) = self.claim.take() {
            claims().lock().unwrap().remove(&claim);
            log::info!("[SyncController] Detached root '{}'", self.root_name);
        }
    }
}

/// Reject a snapshot in which two typed nodes share an identifier.
fn check_unique(snapshot: &Value, ctx: &BindingContext) -> Result<()> {
    let mut seen = HashSet::new();
    for (id, _) in typed_nodes(snapshot, &Path::root(), &ctx.options)? {
        if !seen.insert(id.clone()) {
            return Err(SyncError::DuplicateIdentity { id });
        }
    }
    Ok(())
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for SyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncController")
            .field("root", &self.root_name)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}
