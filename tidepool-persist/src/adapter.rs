//! Write-behind persistence for a [`ValueStore`].
//!
//! ```text
//!   write(k, v) ──► inner ValueStore (visible now)
//!        │
//!        └──► pending[k] = Put(v) | Delete ──► debounce timer (once)
//!                                                   │ fires after `debounce`
//!                                                   ▼
//!                             take(pending) ──► one durable transaction
//!                                                   │ on failure
//!                                                   ▼
//!                             re-queue entries not superseded since
//! ```
//!
//! Writes are visible to readers immediately and durable within roughly
//! one debounce window. A crash inside that window loses the write from
//! disk.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use tidepool_core::schedule::sleep_until;
use tidepool_core::{
    Blob, Clock, DeadlineQueue, Listener, MonotonicClock, Observable, Scheduler, StateSnapshot,
    StateStore, Subscription, TaskId, ValueStore,
};
use tokio::sync::Notify;

use crate::storage::{DurableBackend, DurableHandle, PendingWrite, PersistError};

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Durable database name
    pub name: String,
    pub schema_version: u32,
    /// Quiet period between the first unflushed write and the flush
    pub debounce: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            name: "tidepool".to_string(),
            schema_version: 1,
            debounce: Duration::from_millis(100),
        }
    }
}

impl PersistConfig {
    pub fn for_testing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: 1,
            debounce: Duration::from_millis(10),
        }
    }
}

/// A [`ValueStore`] mirrored into a durable backend.
pub struct PersistentStore<B: DurableBackend> {
    inner: ValueStore,
    backend: B,
    config: PersistConfig,
    clock: Rc<dyn Clock>,
    handle: RefCell<Option<Rc<B::Handle>>>,
    /// Latest queued mutation per key
    pending: RefCell<BTreeMap<String, PendingWrite>>,
    timers: RefCell<DeadlineQueue<()>>,
    flush_task: Cell<Option<TaskId>>,
    in_flight: Cell<bool>,
    commits: Cell<u64>,
    wake: Notify,
}

impl<B: DurableBackend> PersistentStore<B> {
    /// Wrap a fresh store, timing debounces with tokio's clock.
    pub fn new(backend: B, config: PersistConfig) -> Self {
        Self::with_store(ValueStore::new(), backend, config, Rc::new(MonotonicClock::new()))
    }

    /// Wrap an existing store with an explicit clock.
    pub fn with_store(
        inner: ValueStore,
        backend: B,
        config: PersistConfig,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            backend,
            config,
            clock,
            handle: RefCell::new(None),
            pending: RefCell::default(),
            timers: RefCell::default(),
            flush_task: Cell::new(None),
            in_flight: Cell::new(false),
            commits: Cell::new(0),
            wake: Notify::new(),
        }
    }

    // ─── Hydration ────────────────────────────────────────────────────

    /// Open the durable store and replay every persisted entry into the
    /// wrapped store under a single flush. Returns the number replayed.
    ///
    /// Keys written before hydration keep their newer in-memory value and
    /// stay queued for the next flush.
    pub fn hydrate(&self) -> Result<usize, PersistError> {
        if self.is_hydrated() {
            log::debug!("store '{}' already hydrated", self.config.name);
            return Ok(0);
        }

        let handle = self
            .backend
            .open(&self.config.name, self.config.schema_version)?;
        let entries = handle.load_all()?;
        *self.handle.borrow_mut() = Some(Rc::new(handle));

        let replayed = self.inner.batch(|| {
            let mut replayed = 0;
            for (key, value) in entries {
                if self.pending.borrow().contains_key(&key) {
                    continue;
                }
                self.inner.write(&key, Some(value));
                replayed += 1;
            }
            replayed
        });

        if !self.pending.borrow().is_empty() {
            self.schedule_flush();
        }
        log::info!(
            "hydrated store '{}': {replayed} entries",
            self.config.name
        );
        Ok(replayed)
    }

    pub fn is_hydrated(&self) -> bool {
        self.handle.borrow().is_some()
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Write through to the wrapped store and queue the mutation.
    pub fn write(&self, key: &str, value: Option<Blob>) -> bool {
        let effective = self.inner.write(key, value.clone());
        self.pending
            .borrow_mut()
            .insert(key.to_owned(), PendingWrite::from_value(value));
        self.schedule_flush();
        effective
    }

    /// Finish a render cycle and queue tombstones for collected keys.
    pub fn end_render(&self) -> Vec<String> {
        let orphans = self.inner.end_render();
        if !orphans.is_empty() {
            {
                let mut pending = self.pending.borrow_mut();
                for key in &orphans {
                    pending.insert(key.clone(), PendingWrite::Delete);
                }
            }
            log::debug!("queued {} orphan tombstone(s)", orphans.len());
            self.schedule_flush();
        }
        orphans
    }

    // ─── Flushing ─────────────────────────────────────────────────────

    fn schedule_flush(&self) {
        if let Some(id) = self.flush_task.get() {
            if self.timers.borrow().contains(id) {
                return;
            }
        }
        let deadline = self.clock.now() + self.config.debounce;
        let id = self.timers.borrow_mut().schedule(deadline, ());
        self.flush_task.set(Some(id));
        log::trace!("persistence flush armed for {deadline:?}");
        self.wake.notify_one();
    }

    /// Earliest time at which [`run_due`](Self::run_due) has work.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.borrow().next_deadline()
    }

    /// Flush if the debounce deadline has passed. Returns the number of
    /// entries committed.
    pub async fn run_due(&self) -> Result<usize, PersistError> {
        let due = self.timers.borrow_mut().pop_due(self.clock.now());
        if due.is_empty() {
            return Ok(0);
        }
        self.flush_task.set(None);
        self.flush_pending().await
    }

    /// Commit everything queued now, cancelling any armed debounce.
    ///
    /// Before hydration, or while another commit is in flight, nothing is
    /// committed and the entries stay queued.
    pub async fn flush_pending(&self) -> Result<usize, PersistError> {
        if let Some(id) = self.flush_task.take() {
            self.timers.borrow_mut().cancel(id);
        }

        let handle = self.handle.borrow().clone();
        let Some(handle) = handle else {
            log::debug!("flush skipped: store '{}' not hydrated", self.config.name);
            return Ok(0);
        };
        if self.in_flight.get() {
            self.schedule_flush();
            return Ok(0);
        }

        let writes: Vec<(String, PendingWrite)> =
            std::mem::take(&mut *self.pending.borrow_mut()).into_iter().collect();
        if writes.is_empty() {
            return Ok(0);
        }

        self.in_flight.set(true);
        let result = {
            let _guard = InFlightGuard(&self.in_flight);
            handle.commit(&writes).await
        };

        match result {
            Ok(()) => {
                self.commits.set(self.commits.get() + 1);
                log::debug!(
                    "committed {} entries to '{}'",
                    writes.len(),
                    self.config.name
                );
                Ok(writes.len())
            }
            Err(e) => {
                log::error!("commit to '{}' failed: {e}", self.config.name);
                {
                    let mut pending = self.pending.borrow_mut();
                    for (key, write) in writes {
                        pending.entry(key).or_insert(write);
                    }
                }
                self.schedule_flush();
                Err(e)
            }
        }
    }

    /// Drive debounced flushes forever. Commit failures are logged and
    /// retried on the next debounce.
    pub async fn run(&self) {
        loop {
            sleep_until(self.clock.as_ref(), self.next_deadline(), &self.wake).await;
            // Failures are already logged and re-queued
            let _ = self.run_due().await;
        }
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub fn inner(&self) -> &ValueStore {
        &self.inner
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn pending_write(&self, key: &str) -> Option<PendingWrite> {
        self.pending.borrow().get(key).cloned()
    }

    /// Successful durable commits made by this adapter.
    pub fn commit_count(&self) -> u64 {
        self.commits.get()
    }

    pub fn is_commit_in_flight(&self) -> bool {
        self.in_flight.get()
    }
}

struct InFlightGuard<'a>(&'a Cell<bool>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<B: DurableBackend> Observable for PersistentStore<B> {
    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.subscribe(listener)
    }

    fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription {
        self.inner.subscribe_key(key, listener)
    }

    fn snapshot_version(&self) -> u64 {
        self.inner.snapshot_version()
    }

    fn key_version(&self, key: &str) -> u64 {
        self.inner.key_version(key)
    }

    fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        self.inner.set_scheduler(scheduler)
    }

    fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch(f)
    }
}

impl<B: DurableBackend> StateStore for PersistentStore<B> {
    fn read(&self, key: &str) -> Option<Blob> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: Option<Blob>) -> bool {
        PersistentStore::write(self, key, value)
    }

    fn has(&self, key: &str) -> bool {
        self.inner.has(key)
    }

    fn mark_active(&self, key: &str) {
        self.inner.mark_active(key)
    }

    fn begin_render(&self) {
        self.inner.begin_render()
    }

    fn end_render(&self) -> Vec<String> {
        PersistentStore::end_render(self)
    }

    fn register<T, F>(&self, id: &str, computation: F)
    where
        T: 'static,
        F: Fn(&StateSnapshot) -> T + 'static,
    {
        self.inner.register(id, computation)
    }

    fn result<T: Clone + 'static>(&self, id: &str) -> Option<T> {
        self.inner.result(id)
    }
}
