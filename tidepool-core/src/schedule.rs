//! Deterministic timers: a deadline queue plus pluggable clocks.
//!
//! Debounced persistence flushes and remote polling never call into an
//! ambient delayed-callback facility. They put tasks into a
//! [`DeadlineQueue`] and a driver pops whatever is due against a [`Clock`].
//! Tests use [`ManualClock`] and advance time by hand; production drivers
//! use [`MonotonicClock`] together with [`sleep_until`].
//!
//! ```text
//!   schedule(now + 100ms, task) ──► BTreeMap<(deadline, id), task>
//!                                            │
//!   pop_due(now) ◄───────────────────────────┘  deadline order, FIFO on ties
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

/// Source of "now", measured as elapsed time since the clock's origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock backed by `tokio::time::Instant` (so paused tokio time works).
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Jump to an absolute time. Never moves backwards.
    pub fn set(&self, to: Duration) {
        if to > self.now.get() {
            self.now.set(to);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Identifier of a scheduled task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Tasks ordered by deadline.
pub struct DeadlineQueue<T> {
    entries: BTreeMap<(Duration, TaskId), T>,
    deadlines: FxHashMap<TaskId, Duration>,
    next_id: u64,
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: FxHashMap::default(),
            next_id: 0,
        }
    }

    /// Schedule `task` to become due at `deadline`.
    pub fn schedule(&mut self, deadline: Duration, task: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.entries.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a scheduled task, returning it if it had not fired yet.
    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    /// Whether `id` is still waiting to fire.
    pub fn contains(&self, id: TaskId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every task whose deadline is `<= now`.
    pub fn pop_due(&mut self, now: Duration) -> Vec<(TaskId, T)> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let task = entry.remove();
            self.deadlines.remove(&id);
            due.push((id, task));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending task.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until `deadline` on `clock`, or until `wake` is notified.
///
/// With no deadline this only returns on a wake-up. Drivers call it in a
/// loop and re-read the queue afterwards.
pub async fn sleep_until(clock: &dyn Clock, deadline: Option<Duration>, wake: &Notify) {
    match deadline {
        Some(deadline) => {
            let wait = deadline.saturating_sub(clock.now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wake.notified() => {}
            }
        }
        None => wake.notified().await,
    }
}
