//! # tidepool-persist — durable write-behind for tidepool stores
//!
//! [`PersistentStore`] wraps a [`tidepool_core::ValueStore`]: reads and
//! writes hit memory synchronously, while a debounced flush mirrors them
//! into a [`DurableBackend`] in one atomic transaction per window.
//!
//! ```text
//!   hydrate() ──► backend.open(name, schema) ──► load_all ──► replay (1 flush)
//!   write()   ──► inner store + pending map ──► debounce ──► commit
//!   end_render() ──► inner GC ──► tombstones for collected keys
//! ```
//!
//! Backends: [`RocksBackend`] (one RocksDB database per store name) and
//! [`MemoryBackend`] (shared in-process maps with failure injection).

pub mod adapter;
pub mod storage;

pub use adapter::{PersistConfig, PersistentStore};
pub use storage::{
    DurableBackend, DurableHandle, MemoryBackend, MemoryHandle, PendingWrite, PersistError,
    RocksBackend, RocksConfig, RocksHandle, StoreMeta,
};
