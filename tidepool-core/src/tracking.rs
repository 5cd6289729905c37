//! Scoped dependency tracking.
//!
//! A [`DependencyTracker`] records which keys are read while a scope is
//! open. Scopes nest; a read is attributed to the innermost scope only.
//! The tracker belongs to one store instance and is passed around
//! explicitly, there is no process-wide tracking stack.
//!
//! The recompute engine does not consult this tracker: registrations are
//! re-run on every flush regardless of what they read.

use std::cell::RefCell;
use std::collections::BTreeSet;

#[derive(Default)]
pub struct DependencyTracker {
    stack: RefCell<Vec<BTreeSet<String>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside a fresh tracking scope and return the keys it read.
    ///
    /// The scope is popped on every exit path, unwinding included.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> (R, BTreeSet<String>) {
        self.stack.borrow_mut().push(BTreeSet::new());
        let mut guard = ScopeGuard {
            tracker: self,
            finished: false,
        };
        let result = f();
        let deps = guard.finish();
        (result, deps)
    }

    /// Attribute a read of `key` to the innermost open scope, if any.
    pub fn record(&self, key: &str) {
        if let Some(top) = self.stack.borrow_mut().last_mut() {
            if !top.contains(key) {
                top.insert(key.to_owned());
            }
        }
    }

    /// Whether a scope is currently open.
    pub fn is_tracking(&self) -> bool {
        !self.stack.borrow().is_empty()
    }

    /// Number of nested scopes currently open.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}

struct ScopeGuard<'a> {
    tracker: &'a DependencyTracker,
    finished: bool,
}

impl ScopeGuard<'_> {
    fn finish(&mut self) -> BTreeSet<String> {
        self.finished = true;
        self.tracker.stack.borrow_mut().pop().unwrap_or_default()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.stack.borrow_mut().pop();
        }
    }
}
