//! Transactional resilience layer for database-backed services.
//!
//! Database work fails in ways that are worth retrying (deadlocks,
//! serialization failures, dropped connections) and in ways that are not
//! (constraint violations, missing rows). This crate classifies store errors,
//! retries the retryable ones with exponential backoff, and builds bulk and
//! concurrent execution on top of that retry loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Service Layer                           │
//! ├──────────────────────────┬───────────────────────────────────┤
//! │  ChunkedRunner           │  ConcurrentTransactionManager     │
//! │  (sequential chunks)     │  (bounded worker pool)            │
//! ├──────────────────────────┴───────────────────────────────────┤
//! │        TransactionExecutor  (ServiceExecutor prefixes)       │
//! │     classify ─▶ backoff ─▶ sleep ─▶ retry    (Metrics)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │      StorageBackend / Transaction        (HealthProber)      │
//! ├──────────────┬───────────────────────────────────────────────┤
//! │ MemoryBackend│            driver adapters                    │
//! │   (testing)  │              (production)                     │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use monstera_resilience::{MemoryBackend, RetryPolicy, TransactionExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryBackend::new();
//!     let executor = TransactionExecutor::new(RetryPolicy::default());
//!
//!     let written = executor
//!         .execute(&CancellationToken::new(), &store, "create_user", |txn| {
//!             Box::pin(async move {
//!                 txn.set(b"user:123".to_vec(), b"Alice".to_vec());
//!                 Ok(1)
//!             })
//!         })
//!         .await?;
//!
//!     assert_eq!(written, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Backends report failures as [`StorageError`], attaching a
//! [`DatabaseError`] with the SQLSTATE code when the driver has one.
//! [`classify`] maps every error to an [`ErrorKind`]; the executor ends with a
//! [`TxError`] that keeps the last store error as its source.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (error constructors,
//!   fast retry policies, flaky operations). Enable this in `[dev-dependencies]` for integration
//!   tests.
//! - **`failpoints`**: Compiles in the `fail` injection sites (`memory-before-commit`,
//!   `health-check`, `retry-before-sleep`).

#![deny(unsafe_code)]

pub mod backend;
pub mod backoff;
pub mod bulk;
pub mod classify;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod service;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use backoff::{compute_backoff, compute_backoff_with};
pub use bulk::{ChunkError, ChunkRange, ChunkedRunner, ProgressFn};
pub use classify::{ErrorKind, classify, classify_message, classify_sql_state, is_retryable};
pub use concurrent::ConcurrentTransactionManager;
pub use config::{BulkConfig, ConcurrencyConfig, HealthConfig, ResilienceConfig, RetryPolicy};
pub use error::{
    BoxError, ConfigError, DatabaseError, StorageError, StorageResult, TxError, TxResult,
};
pub use health::{HealthError, HealthProber, HealthState, Readiness};
pub use memory::MemoryBackend;
pub use metrics::{BatchMetrics, BatchSummary, LatencyPercentiles, Metrics, MetricsSnapshot};
pub use retry::{
    AttemptObserver, AttemptOutcome, AttemptRecord, BoxFuture, BoxedOperation, RetryStats,
    TransactionExecutor, boxed_operation,
};
pub use service::{ServiceExecutor, TransactionKind};
pub use transaction::Transaction;
