//! Durable backing stores.
//!
//! ```text
//! ┌─────────────────┐  open(name, schema)  ┌──────────────────────────────┐
//! │ PersistentStore │ ───────────────────► │ DurableBackend               │
//! │  (debounced)    │                      │  ├─ RocksBackend  (on disk)  │
//! └────────┬────────┘                      │  └─ MemoryBackend (tests)    │
//!          │ load_all / commit             └──────────────┬───────────────┘
//!          ▼                                              ▼
//!   ┌──────────────┐                    ┌──────────────────────────────────┐
//!   │DurableHandle │ ─────────────────► │ "entries": key → blob            │
//!   └──────────────┘                    │ "meta":    StoreMeta (schema)    │
//!                                       └──────────────────────────────────┘
//! ```
//!
//! A commit is one atomic transaction: either every put and delete in it
//! lands or none does.

pub mod memory;
pub mod rocks;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::{codec, Blob};

pub use memory::{MemoryBackend, MemoryHandle};
pub use rocks::{RocksBackend, RocksConfig, RocksHandle};

/// One queued mutation of a persisted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Put(Blob),
    /// Tombstone
    Delete,
}

impl PendingWrite {
    pub fn from_value(value: Option<Blob>) -> Self {
        match value {
            Some(blob) => PendingWrite::Put(blob),
            None => PendingWrite::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingWrite::Delete)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// Backend-internal failure
    #[error("Database error: {0}")]
    Database(String),
    /// The stored schema is newer than the one this build understands
    #[error("Schema version {stored} on disk is newer than requested version {requested}")]
    SchemaTooNew { stored: u32, requested: u32 },
    #[error("Invalid store name: {0:?}")]
    InvalidName(String),
    #[error("Corrupt entry: {0}")]
    Corrupt(String),
    /// Failure reported by a non-RocksDB backend
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<rocksdb::Error> for PersistError {
    fn from(e: rocksdb::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

/// Factory for per-store durable handles.
pub trait DurableBackend {
    type Handle: DurableHandle;

    /// Open (creating if needed) the database for `name` at
    /// `schema_version`.
    fn open(&self, name: &str, schema_version: u32) -> Result<Self::Handle, PersistError>;
}

/// An opened database.
pub trait DurableHandle {
    /// Every persisted entry.
    fn load_all(&self) -> Result<Vec<(String, Blob)>, PersistError>;

    /// Apply `writes` as one atomic transaction.
    fn commit(
        &self,
        writes: &[(String, PendingWrite)],
    ) -> impl Future<Output = Result<(), PersistError>>;
}

/// Bookkeeping stored next to the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    /// Seconds since the epoch
    pub created_at: u64,
    pub upgraded_at: u64,
}

impl StoreMeta {
    pub(crate) fn new(schema_version: u32) -> Self {
        let now = unix_now();
        Self {
            schema_version,
            created_at: now,
            upgraded_at: now,
        }
    }

    pub(crate) fn encode(&self) -> Result<Blob, PersistError> {
        codec::encode(self).map_err(|e| PersistError::Corrupt(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        codec::decode(bytes).map_err(|e| PersistError::Corrupt(format!("store meta: {e}")))
    }

    /// Reconcile stored metadata with the requested schema version.
    ///
    /// Returns the metadata to write back, or `None` when nothing changed.
    pub(crate) fn reconcile(
        stored: Option<StoreMeta>,
        requested: u32,
    ) -> Result<Option<StoreMeta>, PersistError> {
        match stored {
            None => Ok(Some(StoreMeta::new(requested))),
            Some(meta) if meta.schema_version > requested => Err(PersistError::SchemaTooNew {
                stored: meta.schema_version,
                requested,
            }),
            Some(meta) if meta.schema_version < requested => {
                log::info!(
                    "upgrading store schema v{} -> v{requested}",
                    meta.schema_version
                );
                Ok(Some(StoreMeta {
                    schema_version: requested,
                    upgraded_at: unix_now(),
                    ..meta
                }))
            }
            Some(_) => Ok(None),
        }
    }
}

/// Store names become directory names, so they are restricted to a
/// filesystem-safe alphabet.
pub(crate) fn validate_name(name: &str) -> Result<(), PersistError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PersistError::InvalidName(name.to_owned()))
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
