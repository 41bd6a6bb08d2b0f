//! In-memory optimistic-concurrency store.
//!
//! [`MemoryBackend`] implements [`StorageBackend`] over a [`BTreeMap`] and is
//! the reference store for tests and local development.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Versioned keys**: Every committed write bumps the key's version
//! - **Optimistic transactions**: A transaction remembers the version of every key it read; commit
//!   fails with SQLSTATE `40001` if any of them changed in the meantime, exactly like a
//!   `SERIALIZABLE` PostgreSQL transaction
//! - **Observable**: Counts commits, conflicts and open transactions so tests can assert the
//!   at-most-one-commit and always-ended guarantees
//!
//! # Example
//!
//! ```
//! use monstera_resilience::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! let mut first = backend.transaction().await.unwrap();
//! let mut second = backend.transaction().await.unwrap();
//! assert_eq!(first.get(b"counter").await.unwrap(), None);
//! assert_eq!(second.get(b"counter").await.unwrap(), None);
//!
//! first.set(b"counter".to_vec(), b"1".to_vec());
//! second.set(b"counter".to_vec(), b"1".to_vec());
//! first.commit().await.unwrap();
//!
//! let err = second.commit().await.unwrap_err();
//! assert_eq!(err.sql_state(), Some("40001"));
//! # });
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::{Mutex, RwLock};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    health::Readiness,
    transaction::Transaction,
};

/// SQLSTATE reported when a commit loses an optimistic-concurrency race.
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Default)]
struct Store {
    values: BTreeMap<Vec<u8>, Bytes>,
    /// Survives deletes so that a delete is a visible change to readers.
    versions: BTreeMap<Vec<u8>, u64>,
}

impl Store {
    fn version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn write(&mut self, key: Vec<u8>, value: Option<Bytes>) {
        let version = self.version(&key) + 1;
        match value {
            Some(value) => {
                self.values.insert(key.clone(), value);
            },
            None => {
                self.values.remove(&key);
            },
        }
        self.versions.insert(key, version);
    }
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    conflicts: AtomicU64,
    open_transactions: AtomicUsize,
}

/// In-memory transactional store.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data and counters.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<RwLock<Store>>,
    counters: Arc<Counters>,
    unhealthy: Arc<RwLock<Option<String>>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions committed so far, including ones with no writes.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.counters.commits.load(Ordering::Relaxed)
    }

    /// Number of commits rejected with a serialization failure.
    #[must_use]
    pub fn conflict_count(&self) -> u64 {
        self.counters.conflicts.load(Ordering::Relaxed)
    }

    /// Number of transactions opened and not yet committed, rolled back or dropped.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.counters.open_transactions.load(Ordering::Relaxed)
    }

    /// Number of keys currently holding a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().values.len()
    }

    /// Returns `true` if no key holds a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes subsequent health checks report [`Readiness::NotReady`].
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        *self.unhealthy.write() = Some(reason.into());
    }

    /// Clears a previous [`mark_unhealthy`](Self::mark_unhealthy).
    pub fn mark_healthy(&self) {
        *self.unhealthy.write() = None;
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("keys", &self.len())
            .field("commits", &self.commit_count())
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.store.read().values.get(key).cloned())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.store.write().write(key, Some(Bytes::from(value)));
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut store = self.store.write();
        if store.values.contains_key(key) {
            store.write(key.to_vec(), None);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        self.counters.open_transactions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            backend: self.clone(),
            read_versions: Mutex::new(BTreeMap::new()),
            pending_writes: BTreeMap::new(),
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<Readiness> {
        fail_point!("health-check", |_| {
            Err(StorageError::connection("injected health check failure"))
        });

        Ok(match self.unhealthy.read().clone() {
            Some(reason) => Readiness::NotReady { reason },
            None => Readiness::Ready,
        })
    }
}

/// Buffers writes until commit and validates its read set against the
/// store's key versions.
struct MemoryTransaction {
    backend: MemoryBackend,
    /// Version of each key at the time this transaction first read it.
    read_versions: Mutex<BTreeMap<Vec<u8>, u64>>,
    pending_writes: BTreeMap<Vec<u8>, Option<Bytes>>,
}

impl MemoryTransaction {
    fn validate(&self, store: &Store) -> StorageResult<()> {
        let read_versions = self.read_versions.lock();
        if read_versions.iter().any(|(key, seen)| store.version(key) != *seen) {
            return Err(StorageError::sql(
                SERIALIZATION_FAILURE,
                "could not serialize access due to concurrent update",
            ));
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.backend.counters.open_transactions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if let Some(value) = self.pending_writes.get(key) {
            return Ok(value.clone());
        }
        let store = self.backend.store.read();
        self.read_versions.lock().entry(key.to_vec()).or_insert_with(|| store.version(key));
        Ok(store.values.get(key).cloned())
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, Some(Bytes::from(value)));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, None);
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        fail_point!("memory-before-commit", |_| {
            Err(StorageError::sql(SERIALIZATION_FAILURE, "injected serialization failure"))
        });

        let writes = std::mem::take(&mut self.pending_writes);
        let mut store = self.backend.store.write();
        if let Err(err) = self.validate(&store) {
            self.backend.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        for (key, value) in writes {
            store.write(key, value);
        }
        self.backend.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
