//! # tidepool-core — Reactive key-value state store
//!
//! An in-process store of opaque binary values with batched mutation,
//! versioned change notification, derived-computation re-execution and
//! render-cycle-scoped garbage collection of unused keys.
//!
//! ## Architecture
//!
//! ```text
//!   write(k, v) ──► ValueStore ──► values (copy-on-write map)
//!                       │
//!                       │ mark_changed(k)
//!                       ▼
//!                ┌──────────────┐   before notify   ┌────────────────┐
//!                │ChangeNotifier│ ─────────────────► │RecomputeEngine │
//!                │ versions     │                    │ (every flush)  │
//!                │ batch depth  │                    └────────────────┘
//!                │ scheduler    │
//!                └──────┬───────┘
//!                       │ flush
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   key listeners (per k)     global listeners
//! ```
//!
//! ## Modules
//!
//! - [`store`] — [`ValueStore`], render-cycle GC, [`StateSnapshot`]
//! - [`notify`] — [`ChangeNotifier`], subscriptions, batching, scheduling
//! - [`recompute`] — [`RecomputeEngine`] (coarse re-execution on flush)
//! - [`tracking`] — [`DependencyTracker`] (scoped read tracking)
//! - [`schedule`] — [`DeadlineQueue`] and clocks for deterministic timers
//! - [`codec`] — bincode encoding of typed values into blobs
//! - [`traits`] — [`Observable`] and [`StateStore`] interfaces

pub mod codec;
pub mod notify;
pub mod recompute;
pub mod schedule;
pub mod store;
pub mod tracking;
pub mod traits;

/// Opaque binary value stored against a key. Equality is byte-wise.
pub type Blob = Vec<u8>;

// Re-exports for convenience
pub use codec::{CodecError, TypedStore};
pub use notify::{ChangeNotifier, FlushFn, Listener, Scheduler, Subscription};
pub use recompute::RecomputeEngine;
pub use schedule::{Clock, DeadlineQueue, ManualClock, MonotonicClock, TaskId};
pub use store::{StateSnapshot, ValueStore};
pub use tracking::DependencyTracker;
pub use traits::{Observable, StateStore};
