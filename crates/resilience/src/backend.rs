//! Store handle trait definition.
//!
//! [`StorageBackend`] is the seam between this crate and a real database
//! driver. The resilience layer only needs two capabilities from it: opening
//! a [`Transaction`] and reporting its [`Readiness`]. The plain key-value
//! accessors exist so that callers and tests can seed and inspect state
//! outside a transaction.
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map driver errors to [`StorageError`](crate::StorageError), filling in
//!    [`DatabaseError`](crate::DatabaseError) with the SQLSTATE code when the
//!    driver exposes one
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::StorageResult,
    health::Readiness,
    transaction::Transaction,
};

/// Abstract transactional store.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent transactions.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`transaction`](StorageBackend::transaction) | Begin an atomic transaction |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use monstera_resilience::{StorageBackend, MemoryBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on store errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any existing value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Removes a key. Deleting a missing key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Begins a new transaction.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Runs a minimal round trip and reports whether transactions can run.
    ///
    /// `Err` means the check itself failed (e.g., connection refused), as
    /// opposed to the store answering [`Readiness::NotReady`].
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<Readiness>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        (**self).transaction().await
    }

    async fn health_check(&self) -> StorageResult<Readiness> {
        (**self).health_check().await
    }
}
