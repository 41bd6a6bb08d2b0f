//! Transaction trait for atomic store operations.
//!
//! A [`Transaction`] is the only handle an operation closure receives. The
//! [executor](crate::retry::TransactionExecutor) opens one per attempt and
//! always ends it: either [`commit`](Transaction::commit) succeeds, or the
//! handle is [rolled back](Transaction::rollback) or dropped.
//!
//! # Transaction Semantics
//!
//! - **Atomicity**: All operations in a transaction either succeed together or fail together
//! - **Read-your-writes**: Reads within a transaction see pending writes
//! - **Buffering**: Writes are buffered until commit
//!
//! # Example
//!
//! ```
//! use monstera_resilience::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! backend.set(b"expense:17:status".to_vec(), b"submitted".to_vec()).await.unwrap();
//!
//! let mut txn = backend.transaction().await.unwrap();
//! txn.set(b"expense:17:status".to_vec(), b"approved".to_vec());
//! txn.set(b"expense:17:approver".to_vec(), b"u-42".to_vec());
//! txn.commit().await.unwrap();
//!
//! let status = backend.get(b"expense:17:status").await.unwrap().unwrap();
//! assert_eq!(&status[..], b"approved");
//! # });
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Transaction handle for atomic multi-operation commits.
///
/// Writes are buffered until [`commit`](Transaction::commit). A
/// [`get`](Transaction::get) sees the transaction's own pending writes.
///
/// # Concurrency
///
/// Implementations may use optimistic concurrency control: if another
/// transaction modified a key this one read and committed first, `commit`
/// fails with a serialization error (SQLSTATE `40001`), which the
/// [classifier](crate::classify) treats as retryable.
#[async_trait]
pub trait Transaction: Send {
    /// Gets a value within the transaction.
    ///
    /// Checks pending writes first, then the underlying store.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist or was deleted in this transaction
    /// - `Err(...)` on store errors
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers a set operation within the transaction.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers a delete operation within the transaction.
    fn delete(&mut self, key: Vec<u8>);

    /// Commits all buffered operations atomically.
    ///
    /// Consumes the transaction. After commit, successful or not, the
    /// transaction cannot be used further.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::StorageError) if the store rejects
    /// the commit, for example on a serialization conflict.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards all buffered operations.
    ///
    /// Dropping a transaction without committing has the same effect; this
    /// method exists so that stores holding server-side state can release it
    /// eagerly and report failures.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::StorageError) if the store failed to
    /// release the transaction. The buffered writes are never applied either way.
    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
