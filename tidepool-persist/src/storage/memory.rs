//! In-memory durable backend.
//!
//! Handles opened from clones of one [`MemoryBackend`] share the same
//! databases, so a test can "restart" a store by hydrating a new one from
//! the same backend. Commits can be delayed and failed on demand.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tidepool_core::Blob;

use super::{validate_name, DurableBackend, DurableHandle, PendingWrite, PersistError, StoreMeta};

#[derive(Default)]
struct MemoryDb {
    meta: Option<StoreMeta>,
    entries: BTreeMap<String, Blob>,
}

#[derive(Default)]
struct Shared {
    databases: RefCell<FxHashMap<String, MemoryDb>>,
    commits: Cell<usize>,
    fail_commits: Cell<usize>,
    latency: Cell<Duration>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Rc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.fail_commits.set(n);
    }

    /// Delay every commit by `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.shared.latency.set(latency);
    }

    /// Successful commits across all databases.
    pub fn commit_count(&self) -> usize {
        self.shared.commits.get()
    }

    /// Persisted entries of `name`.
    pub fn entries(&self, name: &str) -> BTreeMap<String, Blob> {
        self.shared
            .databases
            .borrow()
            .get(name)
            .map(|db| db.entries.clone())
            .unwrap_or_default()
    }

    pub fn schema_version(&self, name: &str) -> Option<u32> {
        self.shared
            .databases
            .borrow()
            .get(name)
            .and_then(|db| db.meta.as_ref().map(|m| m.schema_version))
    }

    /// Write entries directly, bypassing any store.
    pub fn seed<K: Into<String>>(&self, name: &str, entries: impl IntoIterator<Item = (K, Blob)>) {
        let mut databases = self.shared.databases.borrow_mut();
        let db = databases.entry(name.to_owned()).or_default();
        db.entries
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
    }
}

impl DurableBackend for MemoryBackend {
    type Handle = MemoryHandle;

    fn open(&self, name: &str, schema_version: u32) -> Result<MemoryHandle, PersistError> {
        validate_name(name)?;
        let mut databases = self.shared.databases.borrow_mut();
        let db = databases.entry(name.to_owned()).or_default();
        if let Some(meta) = StoreMeta::reconcile(db.meta.clone(), schema_version)? {
            db.meta = Some(meta);
        }
        Ok(MemoryHandle {
            shared: self.shared.clone(),
            name: name.to_owned(),
        })
    }
}

pub struct MemoryHandle {
    shared: Rc<Shared>,
    name: String,
}

impl MemoryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DurableHandle for MemoryHandle {
    fn load_all(&self) -> Result<Vec<(String, Blob)>, PersistError> {
        Ok(self
            .shared
            .databases
            .borrow()
            .get(&self.name)
            .map(|db| {
                db.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, writes: &[(String, PendingWrite)]) -> Result<(), PersistError> {
        let latency = self.shared.latency.get();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failures = self.shared.fail_commits.get();
        if failures > 0 {
            self.shared.fail_commits.set(failures - 1);
            return Err(PersistError::Backend("injected commit failure".into()));
        }

        let mut databases = self.shared.databases.borrow_mut();
        let db = databases.entry(self.name.clone()).or_default();
        for (key, write) in writes {
            match write {
                PendingWrite::Put(blob) => {
                    db.entries.insert(key.clone(), blob.clone());
                }
                PendingWrite::Delete => {
                    db.entries.remove(key);
                }
            }
        }
        self.shared.commits.set(self.shared.commits.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_visible_through_backend() {
        let backend = MemoryBackend::new();
        let handle = backend.open("app", 1).unwrap();
        handle
            .commit(&[
                ("a".into(), PendingWrite::Put(vec![1])),
                ("b".into(), PendingWrite::Put(vec![2])),
            ])
            .await
            .unwrap();
        handle
            .commit(&[("a".into(), PendingWrite::Delete)])
            .await
            .unwrap();

        assert_eq!(backend.commit_count(), 2);
        let entries = backend.entries("app");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("b"), Some(&vec![2]));
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let backend = MemoryBackend::new();
        let handle = backend.open("app", 1).unwrap();
        backend.fail_next_commits(1);

        let result = handle
            .commit(&[("a".into(), PendingWrite::Put(vec![1]))])
            .await;
        assert!(matches!(result, Err(PersistError::Backend(_))));
        assert!(backend.entries("app").is_empty());
        assert_eq!(backend.commit_count(), 0);

        handle
            .commit(&[("a".into(), PendingWrite::Put(vec![1]))])
            .await
            .unwrap();
        assert_eq!(backend.commit_count(), 1);
    }

    #[test]
    fn test_seed_and_load_all() {
        let backend = MemoryBackend::new();
        backend.seed("app", [("x", vec![9]), ("a", vec![1])]);
        let handle = backend.open("app", 1).unwrap();
        assert_eq!(
            handle.load_all().unwrap(),
            vec![("a".to_string(), vec![1]), ("x".to_string(), vec![9])]
        );
    }

    #[test]
    fn test_schema_version_checks() {
        let backend = MemoryBackend::new();
        backend.open("app", 2).unwrap();
        assert_eq!(backend.schema_version("app"), Some(2));
        assert!(matches!(
            backend.open("app", 1),
            Err(PersistError::SchemaTooNew { stored: 2, requested: 1 })
        ));
        backend.open("app", 3).unwrap();
        assert_eq!(backend.schema_version("app"), Some(3));
    }
}
