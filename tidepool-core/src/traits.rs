//! Store interfaces.
//!
//! [`Observable`] is the subscription contract shared by every store
//! flavour (in-memory, persisted, remote cache). [`StateStore`] adds the
//! key-value and render-cycle surface of a local store. Implementations
//! are chosen at construction time; nothing relies on structural typing.

use crate::notify::{Listener, Scheduler, Subscription};
use crate::store::StateSnapshot;
use crate::Blob;

/// Versioned change notification, shaped for "poll a cheap value,
/// re-render on change" consumers.
pub trait Observable {
    /// Listener fired once per flush.
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// Listener fired only on flushes in which `key` changed.
    fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription;

    /// Global version, bumped exactly once per flush.
    fn snapshot_version(&self) -> u64;

    /// Per-key version, 0 for a key never written.
    fn key_version(&self, key: &str) -> u64;

    /// Defer flush delivery to `scheduler`; `None` restores synchronous
    /// flushing.
    fn set_scheduler(&self, scheduler: Option<Scheduler>);

    /// Run `f` with a single coalesced flush at the end.
    fn batch<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized;
}

/// Local key-value store with render-cycle garbage collection and
/// derived computations.
pub trait StateStore: Observable {
    /// Current value of `key`. Marks the key active in this render cycle.
    fn read(&self, key: &str) -> Option<Blob>;

    /// Set (`Some`) or remove (`None`) a value. Returns whether the write
    /// was effective, i.e. changed the stored bytes.
    fn write(&self, key: &str, value: Option<Blob>) -> bool;

    fn set(&self, key: &str, value: Blob) -> bool {
        self.write(key, Some(value))
    }

    fn delete(&self, key: &str) -> bool {
        self.write(key, None)
    }

    /// Membership test. Does not mark the key active.
    fn has(&self, key: &str) -> bool;

    /// Mark `key` active without reading it.
    fn mark_active(&self, key: &str);

    /// Start a render cycle.
    fn begin_render(&self);

    /// Finish a render cycle, collecting keys active in the previous cycle
    /// but not in this one. Returns the collected keys.
    fn end_render(&self) -> Vec<String>;

    /// Bind a derived computation to `id` and run it immediately.
    fn register<T, F>(&self, id: &str, computation: F)
    where
        Self: Sized,
        T: 'static,
        F: Fn(&StateSnapshot) -> T + 'static;

    /// Cached result of the computation registered under `id`.
    fn result<T: Clone + 'static>(&self, id: &str) -> Option<T>
    where
        Self: Sized;
}
