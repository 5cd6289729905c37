//! The in-memory value store.
//!
//! ```text
//!            read(k) ─────┬──► values[k]
//!                         └──► active.current ∪= {k}, tracker.record(k)
//!
//!   write(k, v) ── bytes equal? ──yes──► no-op (no version, no flush)
//!                      │ no
//!                      ▼
//!          values[k] = v, key_version[k] += 1, changed ∪= {k}
//!                      │
//!                      ▼
//!           request_flush (batch / scheduler aware)
//!
//!   begin_render():  previous = current, current = {}
//!   end_render():    delete previous \ current   (one batched flush)
//! ```
//!
//! Values live in a copy-on-write map so a [`StateSnapshot`] handed to
//! derived computations costs one reference-count bump.

use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::cell::RefCell;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;

use crate::codec::{self, CodecError};
use crate::notify::{ChangeNotifier, Listener, Scheduler, Subscription};
use crate::recompute::RecomputeEngine;
use crate::tracking::DependencyTracker;
use crate::traits::{Observable, StateStore};
use crate::Blob;

/// Immutable view of the full store contents at one point in time.
#[derive(Clone, Default)]
pub struct StateSnapshot {
    values: Rc<FxHashMap<String, Blob>>,
}

impl StateSnapshot {
    /// Build a snapshot from key/value pairs (mostly useful in tests).
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Blob)>) -> Self {
        Self {
            values: Rc::new(pairs.into_iter().collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Decode `key` with the blob codec.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<T, CodecError> {
        let bytes = self
            .get(key)
            .ok_or_else(|| CodecError::KeyNotFound(key.to_owned()))?;
        codec::decode(bytes)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl std::fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("keys", &self.values.len())
            .finish()
    }
}

/// Two generations of active keys.
#[derive(Default)]
struct ActiveSet {
    /// Active during the last completed render cycle
    previous: FxHashSet<String>,
    /// Accumulating during the cycle in progress
    current: FxHashSet<String>,
}

impl ActiveSet {
    fn mark(&mut self, key: &str) {
        if !self.current.contains(key) {
            self.current.insert(key.to_owned());
        }
    }

    fn begin(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    fn orphans(&self) -> Vec<String> {
        let mut orphans: Vec<String> = self
            .previous
            .iter()
            .filter(|key| !self.current.contains(*key))
            .cloned()
            .collect();
        orphans.sort();
        orphans
    }
}

struct StoreInner {
    values: RefCell<Rc<FxHashMap<String, Blob>>>,
    active: RefCell<ActiveSet>,
    notifier: Rc<ChangeNotifier>,
    engine: RecomputeEngine,
    tracker: DependencyTracker,
}

impl StoreInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: self.values.borrow().clone(),
        }
    }

    fn recompute(&self) {
        if self.engine.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.engine.rerun_all(&snapshot);
    }
}

/// Reactive key → blob store.
///
/// Cheap to clone; clones are handles onto the same store. All operations
/// are synchronous and must run on one thread.
#[derive(Clone)]
pub struct ValueStore {
    inner: Rc<StoreInner>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_initial(std::iter::empty::<(String, Blob)>())
    }

    /// Create a store pre-populated with `initial`. Initial contents do not
    /// count as writes: every key starts at version 0.
    pub fn with_initial<I, K>(initial: I) -> Self
    where
        I: IntoIterator<Item = (K, Blob)>,
        K: Into<String>,
    {
        let values: FxHashMap<String, Blob> =
            initial.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let inner = Rc::new_cyclic(|this: &Weak<StoreInner>| {
            let notifier = ChangeNotifier::new();
            let this = this.clone();
            notifier.set_before_notify(Some(Rc::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.recompute();
                }
            })));
            StoreInner {
                values: RefCell::new(Rc::new(values)),
                active: RefCell::default(),
                notifier,
                engine: RecomputeEngine::new(),
                tracker: DependencyTracker::new(),
            }
        });

        Self { inner }
    }

    // ─── Reads & writes ───────────────────────────────────────────────

    /// Current value of `key`; marks it active and records it in any open
    /// tracking scope.
    pub fn read(&self, key: &str) -> Option<Blob> {
        self.inner.active.borrow_mut().mark(key);
        self.inner.tracker.record(key);
        self.inner.values.borrow().get(key).cloned()
    }

    /// Membership test. Does not mark the key active.
    pub fn has(&self, key: &str) -> bool {
        self.inner.values.borrow().contains_key(key)
    }

    /// Set or remove `key`. Writing the bytes already stored (or removing
    /// an absent key) is a no-op and returns `false`.
    pub fn write(&self, key: &str, value: Option<Blob>) -> bool {
        {
            let mut values = self.inner.values.borrow_mut();
            let current = values.get(key).map(Vec::as_slice);
            if current == value.as_deref() {
                log::trace!("write to '{key}' absorbed: unchanged");
                return false;
            }
            let map = Rc::make_mut(&mut *values);
            match value {
                Some(blob) => {
                    map.insert(key.to_owned(), blob);
                }
                None => {
                    map.remove(key);
                }
            }
        }

        self.inner.notifier.notify_changed(key);
        true
    }

    pub fn set(&self, key: &str, value: Blob) -> bool {
        self.write(key, Some(value))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.write(key, None)
    }

    /// Run `f`, flushing once when the outermost batch closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.notifier.batch(f)
    }

    /// Run the notification pass now.
    pub fn flush(&self) {
        self.inner.notifier.flush();
    }

    // ─── Render-cycle GC ──────────────────────────────────────────────

    /// Mark `key` active for consumers that read it through another path.
    pub fn mark_active(&self, key: &str) {
        self.inner.active.borrow_mut().mark(key);
    }

    /// Start a render cycle: the current active set becomes the previous.
    pub fn begin_render(&self) {
        self.inner.active.borrow_mut().begin();
    }

    /// Finish a render cycle. Keys active in the previous cycle but not in
    /// this one are deleted under a single flush and returned, sorted.
    pub fn end_render(&self) -> Vec<String> {
        let orphans = self.inner.active.borrow().orphans();
        if orphans.is_empty() {
            return orphans;
        }

        log::debug!("render gc: collecting {} key(s)", orphans.len());
        self.batch(|| {
            for key in &orphans {
                self.write(key, None);
            }
        });
        orphans
    }

    /// Keys marked active in the render cycle in progress, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.active.borrow().current.iter().cloned().collect();
        keys.sort();
        keys
    }

    // ─── Versions & subscriptions ─────────────────────────────────────

    pub fn snapshot_version(&self) -> u64 {
        self.inner.notifier.snapshot_version()
    }

    pub fn key_version(&self, key: &str) -> u64 {
        self.inner.notifier.key_version(key)
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }

    pub fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription {
        self.inner.notifier.subscribe_key(key, listener)
    }

    pub fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        self.inner.notifier.set_scheduler(scheduler);
    }

    /// The notifier driving this store's flushes.
    pub fn notifier(&self) -> &Rc<ChangeNotifier> {
        &self.inner.notifier
    }

    // ─── Derived computations ─────────────────────────────────────────

    /// Register a computation over the full state; it runs now and again
    /// on every flush.
    pub fn register<T, F>(&self, id: &str, computation: F)
    where
        T: 'static,
        F: Fn(&StateSnapshot) -> T + 'static,
    {
        let snapshot = self.inner.snapshot();
        self.inner.engine.register(id, computation, &snapshot);
    }

    pub fn result<T: Clone + 'static>(&self, id: &str) -> Option<T> {
        self.inner.engine.result(id)
    }

    pub fn engine(&self) -> &RecomputeEngine {
        &self.inner.engine
    }

    // ─── Tracking & introspection ─────────────────────────────────────

    /// Run `f` and report every key it read through this store.
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> (R, BTreeSet<String>) {
        self.inner.tracker.scope(f)
    }

    /// Copy-on-write view of the full state.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.borrow().is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.values.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("keys", &self.len())
            .field("version", &self.snapshot_version())
            .finish()
    }
}

impl Observable for ValueStore {
    fn subscribe(&self, listener: Listener) -> Subscription {
        ValueStore::subscribe(self, listener)
    }

    fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription {
        ValueStore::subscribe_key(self, key, listener)
    }

    fn snapshot_version(&self) -> u64 {
        ValueStore::snapshot_version(self)
    }

    fn key_version(&self, key: &str) -> u64 {
        ValueStore::key_version(self, key)
    }

    fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        ValueStore::set_scheduler(self, scheduler)
    }

    fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        ValueStore::batch(self, f)
    }
}

impl StateStore for ValueStore {
    fn read(&self, key: &str) -> Option<Blob> {
        ValueStore::read(self, key)
    }

    fn write(&self, key: &str, value: Option<Blob>) -> bool {
        ValueStore::write(self, key, value)
    }

    fn has(&self, key: &str) -> bool {
        ValueStore::has(self, key)
    }

    fn mark_active(&self, key: &str) {
        ValueStore::mark_active(self, key)
    }

    fn begin_render(&self) {
        ValueStore::begin_render(self)
    }

    fn end_render(&self) -> Vec<String> {
        ValueStore::end_render(self)
    }

    fn register<T, F>(&self, id: &str, computation: F)
    where
        T: 'static,
        F: Fn(&StateSnapshot) -> T + 'static,
    {
        ValueStore::register(self, id, computation)
    }

    fn result<T: Clone + 'static>(&self, id: &str) -> Option<T> {
        ValueStore::result(self, id)
    }
}
