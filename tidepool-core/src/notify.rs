//! Versioned change notification with batching and deferred scheduling.
//!
//! A [`ChangeNotifier`] is the flush machinery every store flavour composes:
//!
//! ```text
//!  mark_changed(k) ──► key_versions[k] += 1, changed ∪= {k}
//!        │
//!  request_flush() ──► batch_depth > 0 ? defer until outermost batch closes
//!        │             scheduler set  ? scheduler(flush)  (coalesced)
//!        ▼                            : flush()            (synchronous)
//!  flush():  version += 1
//!            before_notify hook        (recompute)
//!            key listeners of each changed key
//!            global listeners (once)
//! ```
//!
//! No `RefCell` borrow is held while a listener, hook or scheduler runs, so
//! callbacks are free to read from and write back into the owning store.
//! A flush requested while another is running is folded into an extra pass
//! of the running flush.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};

/// Change callback. Identity (the `Rc` allocation) is what de-duplicates it.
pub type Listener = Rc<dyn Fn()>;

/// Deferred flush handed to a [`Scheduler`].
pub type FlushFn = Box<dyn FnOnce()>;

/// Receives a deferred flush and decides when to run it.
pub type Scheduler = Rc<dyn Fn(FlushFn)>;

type Hook = Rc<dyn Fn()>;

#[derive(Default)]
struct NotifyState {
    /// Global version, +1 per flush pass
    version: u64,
    /// Per-key version, +1 per effective write
    key_versions: FxHashMap<String, u64>,
    /// Keys changed since the last flush, in first-change order
    changed: Vec<String>,
    changed_set: FxHashSet<String>,
    batch_depth: usize,
    /// A flush has been handed to the scheduler and not yet run
    flush_scheduled: bool,
    flushing: bool,
    reflush: bool,
}

#[derive(Default)]
struct Listeners {
    global: Vec<Listener>,
    keyed: FxHashMap<String, Vec<Listener>>,
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

/// Versions, changed-key tracking, listeners and flush scheduling.
pub struct ChangeNotifier {
    state: RefCell<NotifyState>,
    listeners: RefCell<Listeners>,
    scheduler: RefCell<Option<Scheduler>>,
    before_notify: RefCell<Option<Hook>>,
    this: Weak<ChangeNotifier>,
}

impl ChangeNotifier {
    /// Create a notifier. Returned as `Rc` because deferred flushes and
    /// subscriptions keep weak handles back to it.
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            state: RefCell::default(),
            listeners: RefCell::default(),
            scheduler: RefCell::new(None),
            before_notify: RefCell::new(None),
            this: this.clone(),
        })
    }

    /// Install a hook that runs on every flush pass after the version bump
    /// and before any listener is invoked.
    pub fn set_before_notify(&self, hook: Option<Rc<dyn Fn()>>) {
        *self.before_notify.borrow_mut() = hook;
    }

    /// Global version. Cheap "did anything change" comparison value.
    pub fn snapshot_version(&self) -> u64 {
        self.state.borrow().version
    }

    /// Per-key version, 0 for a key that never changed.
    pub fn key_version(&self, key: &str) -> u64 {
        self.state.borrow().key_versions.get(key).copied().unwrap_or(0)
    }

    /// Whether changes are waiting for a flush.
    pub fn has_pending_changes(&self) -> bool {
        !self.state.borrow().changed.is_empty()
    }

    /// Whether a batch is currently open.
    pub fn is_batching(&self) -> bool {
        self.state.borrow().batch_depth > 0
    }

    // ─── Change tracking ──────────────────────────────────────────────

    /// Record an effective change of `key` without requesting a flush.
    pub fn mark_changed(&self, key: &str) {
        let mut state = self.state.borrow_mut();
        *state.key_versions.entry(key.to_owned()).or_insert(0) += 1;
        if state.changed_set.insert(key.to_owned()) {
            state.changed.push(key.to_owned());
        }
    }

    /// Record a change of `key` and request a flush.
    ///
    /// This is the single funnel every mutation path goes through.
    pub fn notify_changed(&self, key: &str) {
        self.mark_changed(key);
        self.request_flush();
    }

    /// Flush now, hand the flush to the scheduler, or defer it to the end
    /// of the enclosing batch.
    pub fn request_flush(&self) {
        if self.state.borrow().batch_depth > 0 {
            return;
        }

        let scheduler = self.scheduler.borrow().clone();
        let Some(scheduler) = scheduler else {
            self.flush();
            return;
        };

        {
            let mut state = self.state.borrow_mut();
            if state.flush_scheduled {
                return;
            }
            state.flush_scheduled = true;
        }

        log::trace!("flush handed to scheduler");
        let this = self.this.clone();
        scheduler(Box::new(move || {
            if let Some(notifier) = this.upgrade() {
                notifier.state.borrow_mut().flush_scheduled = false;
                notifier.flush();
            }
        }));
    }

    /// Run the notification pass.
    ///
    /// Returns immediately when nothing changed since the last flush.
    pub fn flush(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.flushing {
                state.reflush = true;
                return;
            }
            state.flushing = true;
        }
        let _guard = FlushGuard(self);

        loop {
            let (changed, version) = {
                let mut state = self.state.borrow_mut();
                state.reflush = false;
                if state.changed.is_empty() {
                    break;
                }
                state.version += 1;
                state.changed_set.clear();
                (std::mem::take(&mut state.changed), state.version)
            };
            log::debug!("flush v{version}: {} changed key(s)", changed.len());

            let hook = self.before_notify.borrow().clone();
            if let Some(hook) = hook {
                hook();
            }

            for key in &changed {
                let listeners = self
                    .listeners
                    .borrow()
                    .keyed
                    .get(key)
                    .cloned()
                    .unwrap_or_default();
                for listener in listeners {
                    listener();
                }
            }

            let global = self.listeners.borrow().global.clone();
            for listener in global {
                listener();
            }

            if !self.state.borrow().reflush {
                break;
            }
        }
    }

    /// Run `f` with notifications deferred until the outermost batch closes.
    ///
    /// Nested batches coalesce into one flush that observes the final state.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.state.borrow_mut().batch_depth += 1;
        let guard = BatchGuard(self);
        let result = f();
        drop(guard);

        if self.state.borrow().batch_depth == 0 {
            self.request_flush();
        }
        result
    }

    /// Route future flushes through `scheduler`, or flush synchronously
    /// again when `None`.
    ///
    /// A flush handed to the previous scheduler no longer blocks new
    /// requests; if it still runs later it finds nothing to flush or
    /// delivers the pending changes early.
    pub fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        *self.scheduler.borrow_mut() = scheduler;
        self.state.borrow_mut().flush_scheduled = false;
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Register a listener fired once per flush.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        {
            let mut listeners = self.listeners.borrow_mut();
            if !listeners.global.iter().any(|l| same_listener(l, &listener)) {
                listeners.global.push(listener.clone());
            }
        }
        Subscription {
            notifier: self.this.clone(),
            key: None,
            listener,
        }
    }

    /// Register a listener fired only on flushes in which `key` changed.
    pub fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription {
        {
            let mut listeners = self.listeners.borrow_mut();
            let set = listeners.keyed.entry(key.to_owned()).or_default();
            if !set.iter().any(|l| same_listener(l, &listener)) {
                set.push(listener.clone());
            }
        }
        Subscription {
            notifier: self.this.clone(),
            key: Some(key.to_owned()),
            listener,
        }
    }

    fn remove_listener(&self, key: Option<&str>, listener: &Listener) {
        let mut listeners = self.listeners.borrow_mut();
        match key {
            None => listeners.global.retain(|l| !same_listener(l, listener)),
            Some(key) => {
                if let Some(set) = listeners.keyed.get_mut(key) {
                    set.retain(|l| !same_listener(l, listener));
                    if set.is_empty() {
                        listeners.keyed.remove(key);
                    }
                }
            }
        }
    }

    /// Number of global listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().global.len()
    }

    /// Number of listeners scoped to `key`.
    pub fn key_listener_count(&self, key: &str) -> usize {
        self.listeners.borrow().keyed.get(key).map_or(0, Vec::len)
    }

    /// Number of keys that have at least one scoped listener.
    pub fn watched_key_count(&self) -> usize {
        self.listeners.borrow().keyed.len()
    }

    /// Drop every listener and any unflushed changes. Versions are kept.
    pub fn clear(&self) {
        let mut listeners = self.listeners.borrow_mut();
        listeners.global.clear();
        listeners.keyed.clear();
        let mut state = self.state.borrow_mut();
        state.changed.clear();
        state.changed_set.clear();
    }
}

struct BatchGuard<'a>(&'a ChangeNotifier);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.borrow_mut();
        state.batch_depth = state.batch_depth.saturating_sub(1);
    }
}

struct FlushGuard<'a>(&'a ChangeNotifier);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.borrow_mut();
        state.flushing = false;
        state.reflush = false;
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener alive.
#[must_use = "dropping a Subscription keeps the listener registered; call `unsubscribe` to remove it"]
pub struct Subscription {
    notifier: Weak<ChangeNotifier>,
    key: Option<String>,
    listener: Listener,
}

impl Subscription {
    /// Remove the listener. Key-scoped sets left empty are pruned.
    pub fn unsubscribe(self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove_listener(self.key.as_deref(), &self.listener);
        }
    }

    /// The key this subscription is scoped to, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<usize>>, Listener) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        (count, Rc::new(move || c.set(c.get() + 1)))
    }

    #[test]
    fn test_flush_without_changes_is_noop() {
        let notifier = ChangeNotifier::new();
        let (count, listener) = counter();
        let _sub = notifier.subscribe(listener);

        notifier.flush();
        assert_eq!(notifier.snapshot_version(), 0);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_notify_bumps_versions() {
        let notifier = ChangeNotifier::new();
        notifier.notify_changed("a");
        notifier.notify_changed("a");
        notifier.notify_changed("b");

        assert_eq!(notifier.snapshot_version(), 3);
        assert_eq!(notifier.key_version("a"), 2);
        assert_eq!(notifier.key_version("b"), 1);
        assert_eq!(notifier.key_version("never"), 0);
    }

    #[test]
    fn test_batch_coalesces_into_one_flush() {
        let notifier = ChangeNotifier::new();
        let (count, listener) = counter();
        let _sub = notifier.subscribe(listener);

        notifier.batch(|| {
            notifier.notify_changed("a");
            notifier.batch(|| {
                notifier.notify_changed("b");
                notifier.notify_changed("a");
            });
            assert_eq!(count.get(), 0);
        });

        assert_eq!(count.get(), 1);
        assert_eq!(notifier.snapshot_version(), 1);
        assert_eq!(notifier.key_version("a"), 2);
    }

    #[test]
    fn test_key_listeners_fire_only_for_their_key() {
        let notifier = ChangeNotifier::new();
        let (a_count, a_listener) = counter();
        let (b_count, b_listener) = counter();
        let _a = notifier.subscribe_key("a", a_listener);
        let _b = notifier.subscribe_key("b", b_listener);

        notifier.notify_changed("a");
        assert_eq!(a_count.get(), 1);
        assert_eq!(b_count.get(), 0);
    }

    #[test]
    fn test_duplicate_listener_registered_once() {
        let notifier = ChangeNotifier::new();
        let (count, listener) = counter();
        let first = notifier.subscribe(listener.clone());
        let _second = notifier.subscribe(listener);
        assert_eq!(notifier.listener_count(), 1);

        notifier.notify_changed("x");
        assert_eq!(count.get(), 1);

        first.unsubscribe();
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_prunes_empty_key_set() {
        let notifier = ChangeNotifier::new();
        let (_, listener) = counter();
        let sub = notifier.subscribe_key("k", listener);
        assert_eq!(notifier.watched_key_count(), 1);

        sub.unsubscribe();
        assert_eq!(notifier.key_listener_count("k"), 0);
        assert_eq!(notifier.watched_key_count(), 0);
    }

    #[test]
    fn test_scheduler_coalesces_flush_requests() {
        let notifier = ChangeNotifier::new();
        let queued: Rc<RefCell<Vec<FlushFn>>> = Rc::new(RefCell::new(Vec::new()));
        let q = queued.clone();
        notifier.set_scheduler(Some(Rc::new(move |flush: FlushFn| q.borrow_mut().push(flush))));

        let (count, listener) = counter();
        let _sub = notifier.subscribe(listener);

        notifier.notify_changed("a");
        notifier.notify_changed("b");
        assert_eq!(queued.borrow().len(), 1);
        assert_eq!(count.get(), 0);
        assert_eq!(notifier.snapshot_version(), 0);

        let flushes: Vec<FlushFn> = queued.borrow_mut().drain(..).collect();
        for flush in flushes {
            flush();
        }
        assert_eq!(count.get(), 1);
        assert_eq!(notifier.snapshot_version(), 1);

        // A new request after the deferred flush ran schedules again
        notifier.notify_changed("c");
        assert_eq!(queued.borrow().len(), 1);
    }

    #[test]
    fn test_replaced_scheduler_receives_flush_after_drop() {
        let notifier = ChangeNotifier::new();
        // Drops every flush it is handed
        notifier.set_scheduler(Some(Rc::new(|_flush: FlushFn| {})));
        notifier.notify_changed("a");
        assert_eq!(notifier.snapshot_version(), 0);

        let queued: Rc<RefCell<Vec<FlushFn>>> = Rc::new(RefCell::new(Vec::new()));
        let q = queued.clone();
        notifier.set_scheduler(Some(Rc::new(move |flush: FlushFn| q.borrow_mut().push(flush))));

        let (count, listener) = counter();
        let _sub = notifier.subscribe(listener);
        notifier.notify_changed("b");
        assert_eq!(queued.borrow().len(), 1);

        let flushes: Vec<FlushFn> = queued.borrow_mut().drain(..).collect();
        for flush in flushes {
            flush();
        }
        assert_eq!(count.get(), 1);
        assert_eq!(notifier.snapshot_version(), 1);
        assert_eq!(notifier.key_version("a"), 1);
    }

    #[test]
    fn test_clearing_scheduler_restores_sync_flush() {
        let notifier = ChangeNotifier::new();
        notifier.set_scheduler(Some(Rc::new(|_flush: FlushFn| {})));
        notifier.notify_changed("a");
        notifier.set_scheduler(None);

        let (count, listener) = counter();
        let _sub = notifier.subscribe(listener);
        notifier.notify_changed("b");
        assert_eq!(count.get(), 1);
        assert_eq!(notifier.snapshot_version(), 1);
    }

    #[test]
    fn test_reentrant_change_runs_extra_pass() {
        let notifier = ChangeNotifier::new();
        let n = notifier.clone();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let _sub = notifier.subscribe_key(
            "a",
            Rc::new(move || {
                if !f.get() {
                    f.set(true);
                    n.notify_changed("b");
                }
            }),
        );
        let (b_count, b_listener) = counter();
        let _b = notifier.subscribe_key("b", b_listener);

        notifier.notify_changed("a");
        assert_eq!(b_count.get(), 1);
        assert_eq!(notifier.snapshot_version(), 2);
        assert!(!notifier.has_pending_changes());
    }

    #[test]
    fn test_before_notify_runs_before_listeners() {
        let notifier = ChangeNotifier::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        notifier.set_before_notify(Some(Rc::new(move || o.borrow_mut().push("hook"))));
        let o = order.clone();
        let _sub = notifier.subscribe(Rc::new(move || o.borrow_mut().push("listener")));

        notifier.notify_changed("k");
        assert_eq!(*order.borrow(), vec!["hook", "listener"]);
    }
}
