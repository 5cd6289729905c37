//! Derived computations re-executed on every flush.
//!
//! A registration binds an id to a pure function of the full state
//! snapshot. Registering runs the function once; afterwards the owning
//! store re-runs **every** registration on **every** flush. There is no
//! per-registration dependency graph.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::store::StateSnapshot;

type Computation = Rc<dyn Fn(&StateSnapshot) -> Rc<dyn Any>>;

fn same_computation(a: &Computation, b: &Computation) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

struct Registration {
    computation: Computation,
    last_result: Rc<dyn Any>,
}

/// Registry of derived computations and their cached results.
#[derive(Default)]
pub struct RecomputeEngine {
    registrations: RefCell<FxHashMap<String, Registration>>,
    /// Total number of computation executions
    runs: Cell<u64>,
}

impl RecomputeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `computation` to `id`, run it against `snapshot` and cache the
    /// result. Re-registering an id replaces it.
    pub fn register<T, F>(&self, id: &str, computation: F, snapshot: &StateSnapshot)
    where
        T: 'static,
        F: Fn(&StateSnapshot) -> T + 'static,
    {
        let computation: Computation =
            Rc::new(move |state: &StateSnapshot| -> Rc<dyn Any> { Rc::new(computation(state)) });
        let last_result = computation(snapshot);
        self.runs.set(self.runs.get() + 1);

        let replaced = self
            .registrations
            .borrow_mut()
            .insert(
                id.to_owned(),
                Registration {
                    computation,
                    last_result,
                },
            )
            .is_some();
        if replaced {
            log::debug!("registration '{id}' replaced");
        }
    }

    /// Re-run every registration against `snapshot`.
    ///
    /// Computations run with no borrow of the registry held, so they may
    /// look up other registrations' (previous) results.
    pub fn rerun_all(&self, snapshot: &StateSnapshot) {
        let computations: Vec<(String, Computation)> = self
            .registrations
            .borrow()
            .iter()
            .map(|(id, reg)| (id.clone(), reg.computation.clone()))
            .collect();

        for (id, computation) in computations {
            let result = computation(snapshot);
            self.runs.set(self.runs.get() + 1);
            if let Some(reg) = self.registrations.borrow_mut().get_mut(&id) {
                // A re-registration during this pass wins over the stale run
                if same_computation(&reg.computation, &computation) {
                    reg.last_result = result;
                }
            }
        }
    }

    /// Cached result of `id`, or `None` if it was never registered or its
    /// result is not a `T`.
    pub fn result<T: Clone + 'static>(&self, id: &str) -> Option<T> {
        self.registrations
            .borrow()
            .get(id)
            .and_then(|reg| reg.last_result.downcast_ref::<T>().cloned())
    }

    /// Cached result of `id` as a type-erased value.
    pub fn result_any(&self, id: &str) -> Option<Rc<dyn Any>> {
        self.registrations
            .borrow()
            .get(id)
            .map(|reg| reg.last_result.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registrations.borrow().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.borrow().is_empty()
    }

    /// Total computation executions since creation.
    pub fn run_count(&self) -> u64 {
        self.runs.get()
    }
}
