//! Shared test utilities for exercising the resilience layer.
//!
//! Error constructors for the SQLSTATE codes the classifier cares about,
//! fast retry policies that keep paused-clock tests short, operations that
//! fail a fixed number of times, and assertion macros for [`TxResult`]. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! monstera-resilience = { path = "../resilience", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use monstera_resilience::testutil::{deadlock, fast_policy, flaky_operation};
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use crate::{
    config::RetryPolicy,
    error::{StorageError, TxResult},
    retry::{BoxedOperation, boxed_operation},
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"` (zero-padded to 6 digits) encoded
/// as UTF-8 bytes, so lexicographic order matches numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// SQLSTATE `40P01`.
#[must_use]
pub fn deadlock() -> StorageError {
    StorageError::sql("40P01", "deadlock detected")
}

/// SQLSTATE `40001`.
#[must_use]
pub fn serialization_failure() -> StorageError {
    StorageError::sql("40001", "could not serialize access due to concurrent update")
}

/// SQLSTATE `55P03`.
#[must_use]
pub fn lock_timeout() -> StorageError {
    StorageError::sql("55P03", "canceling statement due to lock timeout")
}

/// SQLSTATE `23505`.
#[must_use]
pub fn unique_violation() -> StorageError {
    StorageError::sql("23505", "duplicate key value violates unique constraint")
}

/// SQLSTATE `23503`.
#[must_use]
pub fn foreign_key_violation() -> StorageError {
    StorageError::sql("23503", "update or delete violates foreign key constraint")
}

/// A jitter-free policy with a 1ms base delay and 50ms cap.
///
/// # Panics
///
/// Never for the fixed delays used here.
#[must_use]
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(50))
        .multiplier(2.0)
        .jitter_enabled(false)
        .build()
        .expect("fast policy is valid")
}

/// An operation that fails with `error` on its first `failures` invocations,
/// then writes `key = value` and returns `value`.
///
/// The returned counter reports how many times the operation ran.
pub fn flaky_operation(
    failures: u32,
    error: StorageError,
    key: Vec<u8>,
    value: Vec<u8>,
) -> (BoxedOperation<Vec<u8>>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let operation = boxed_operation(move |txn| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        let error = error.clone();
        let key = key.clone();
        let value = value.clone();
        Box::pin(async move {
            if call < failures {
                return Err(error);
            }
            txn.set(key, value.clone());
            Ok(value)
        })
    });
    (operation, calls)
}

/// Returns `true` if the result failed with the given [`ErrorKind`](crate::ErrorKind).
pub fn failed_with<T>(result: &TxResult<T>, kind: crate::ErrorKind) -> bool {
    matches!(result, Err(err) if err.kind() == Some(kind))
}

/// Assert that a [`TxResult`] failed with the given [`ErrorKind`](crate::ErrorKind).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use monstera_resilience::{ErrorKind, TxError, TxResult, assert_tx_kind, testutil::deadlock};
///
/// let result: TxResult<()> = Err(TxError::RetriesExhausted {
///     operation: "demo".into(),
///     attempts: 4,
///     kind: ErrorKind::Deadlock,
///     source: deadlock(),
/// });
/// assert_tx_kind!(result, ErrorKind::Deadlock);
/// ```
#[macro_export]
macro_rules! assert_tx_kind {
    ($result:expr, $kind:expr) => {
        assert!(
            $crate::testutil::failed_with(&$result, $kind),
            "expected failure of kind {:?}, got: {:?}",
            $kind,
            $result,
        );
    };
}

/// Assert that a [`TxResult`] is `Ok`, returning the inner value.
#[macro_export]
macro_rules! assert_tx_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got TxError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got TxError: {e:?}", $msg),
        }
    };
}
