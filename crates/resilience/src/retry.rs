//! Retrying transactional execution.
//!
//! [`TransactionExecutor`] runs a caller-supplied operation inside a fresh
//! [`Transaction`] per attempt and commits it. Failures are
//! [classified](crate::classify); retryable ones are retried after an
//! [exponential backoff](crate::backoff) until the [`RetryPolicy`] runs out,
//! everything else is returned at once.
//!
//! # Guarantees
//!
//! - At most one attempt commits.
//! - Every transaction the executor opens is committed, rolled back or dropped (which discards it)
//!   before the call returns.
//! - Attempts within one call are strictly sequential.
//! - The caller sees either the operation's value or exactly one [`TxError`].
//!
//! # Cancellation
//!
//! The [`CancellationToken`] is observed before every attempt, while an
//! attempt is in flight and during every backoff sleep. An in-flight attempt
//! is dropped on cancellation, so its transaction never commits.
//!
//! # Example
//!
//! ```
//! use monstera_resilience::{MemoryBackend, RetryPolicy, StorageBackend, TransactionExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = MemoryBackend::new();
//! let executor = TransactionExecutor::new(RetryPolicy::default());
//!
//! let approved = executor
//!     .execute(&CancellationToken::new(), &store, "approve_expense", |txn| {
//!         Box::pin(async move {
//!             txn.set(b"expense:17:status".to_vec(), b"approved".to_vec());
//!             Ok(17)
//!         })
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(approved, 17);
//! assert_eq!(store.commit_count(), 1);
//! # });
//! ```

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use fail::fail_point;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    backoff::compute_backoff,
    classify::{ErrorKind, classify},
    config::RetryPolicy,
    error::{StorageResult, TxError, TxResult},
    metrics::Metrics,
    transaction::Transaction,
};

/// A boxed, sendable future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A type-erased transactional operation, as accepted by the
/// [concurrent manager](crate::concurrent::ConcurrentTransactionManager).
///
/// Build one with [`boxed_operation`].
pub type BoxedOperation<T> = Box<
    dyn for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>>
        + Send
        + 'static,
>;

/// Erases the type of a transactional operation.
///
/// Passing the closure through this function lets the compiler infer the
/// higher-ranked signature the executor needs.
pub fn boxed_operation<T, F>(operation: F) -> BoxedOperation<T>
where
    F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>>
        + Send
        + 'static,
{
    Box::new(operation)
}

/// Callback invoked before every attempt with the 1-based attempt number and
/// the time elapsed since the call started.
pub type AttemptObserver = Arc<dyn Fn(u32, Duration) + Send + Sync>;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The transaction committed.
    Committed,
    /// A retryable failure; the next attempt follows after `delay`.
    Retrying {
        /// Backoff before the next attempt.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// A non-retryable failure ended the call.
    Failed,
    /// A retryable failure on the last permitted attempt.
    Exhausted,
    /// The attempt was abandoned because the caller cancelled.
    Cancelled,
    /// The attempt was abandoned because the call's deadline elapsed.
    TimedOut,
}

/// Record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 0-based attempt index.
    pub attempt: u32,
    /// Time from the start of the call to the end of this attempt.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Classification of the failure, if the attempt failed.
    pub kind: Option<ErrorKind>,
    /// How the attempt ended.
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Statistics for one executor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Operation name passed by the caller.
    pub operation: String,
    /// Attempts started.
    pub attempts: u32,
    /// `true` when the call succeeded after at least one retry.
    pub successful_retry: bool,
    /// Wall time of the whole call, backoff included.
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    /// Classification of every failed attempt, in order.
    pub errors: Vec<ErrorKind>,
    /// Display text of the terminal error, if the call failed.
    pub final_error: Option<String>,
    /// Per-attempt records, in order.
    pub records: Vec<AttemptRecord>,
}

impl RetryStats {
    /// Retries performed, i.e. attempts after the first.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Progress of the retry loop, shared with the deadline handler so a timeout
/// can report what the loop was doing.
#[derive(Debug, Default)]
struct RetryState {
    attempts_started: u32,
    attempts_completed: u32,
    during_backoff: bool,
    errors: Vec<ErrorKind>,
    records: Vec<AttemptRecord>,
}

impl RetryState {
    fn record(
        &mut self,
        attempt: u32,
        started: Instant,
        kind: Option<ErrorKind>,
        outcome: AttemptOutcome,
    ) {
        if let Some(kind) = kind {
            self.errors.push(kind);
        }
        self.records.push(AttemptRecord { attempt, elapsed: started.elapsed(), kind, outcome });
    }

    fn into_stats<T>(self, operation: &str, started: Instant, result: &TxResult<T>) -> RetryStats {
        RetryStats {
            operation: operation.to_owned(),
            attempts: self.attempts_started,
            successful_retry: result.is_ok() && self.attempts_started > 1,
            total_duration: started.elapsed(),
            errors: self.errors,
            final_error: result.as_ref().err().map(ToString::to_string),
            records: self.records,
        }
    }
}

/// Executes transactional operations with classification-driven retries.
///
/// Cheap to clone; clones share the [`Metrics`] handle and attempt observer.
#[derive(Clone)]
pub struct TransactionExecutor {
    policy: RetryPolicy,
    metrics: Option<Metrics>,
    observer: Option<AttemptObserver>,
}

impl std::fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("policy", &self.policy)
            .field("metrics", &self.metrics.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for TransactionExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl TransactionExecutor {
    /// Creates an executor with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, metrics: None, observer: None }
    }

    /// Reports every attempt, retry and terminal outcome to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Invokes `observer(attempt_number, elapsed)` before every attempt.
    #[must_use]
    pub fn with_attempt_observer(
        mut self,
        observer: impl Fn(u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the metrics handle, if one was attached.
    #[must_use]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Runs `operation` in a transaction, retrying retryable failures.
    ///
    /// # Errors
    ///
    /// - [`TxError::Failed`] on a non-retryable error, with the store error as source
    /// - [`TxError::RetriesExhausted`] when every permitted attempt failed retryably
    /// - [`TxError::Cancelled`] when `cancel` fires
    pub async fn execute<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        operation: F,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        self.run(cancel, store, operation_name, None, operation).await.1
    }

    /// Like [`execute`](Self::execute) but also returns the call's [`RetryStats`].
    pub async fn execute_with_stats<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        operation: F,
    ) -> (RetryStats, TxResult<T>)
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        self.run(cancel, store, operation_name, None, operation).await
    }

    /// Like [`execute`](Self::execute) with an overall deadline covering every
    /// attempt and backoff sleep.
    ///
    /// # Errors
    ///
    /// In addition to the errors of [`execute`](Self::execute), returns
    /// [`TxError::Timeout`] when `timeout` elapses. The in-flight attempt, if
    /// any, is dropped and its transaction discarded.
    pub async fn execute_with_timeout<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        timeout: Duration,
        operation_name: &str,
        operation: F,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        self.run(cancel, store, operation_name, Some(timeout), operation).await.1
    }

    /// Like [`execute`](Self::execute), then reports every deadlock and
    /// serialization failure that was absorbed by a retry.
    ///
    /// `recovered(attempt_number, kind, elapsed)` is called once per absorbed
    /// failure, in order, after the call finishes.
    pub async fn execute_with_recovery<S, T, F, R>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        operation: F,
        mut recovered: R,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
        R: FnMut(u32, ErrorKind, Duration),
    {
        let (stats, result) = self.run(cancel, store, operation_name, None, operation).await;
        for record in &stats.records {
            let absorbed = matches!(record.outcome, AttemptOutcome::Retrying { .. });
            if let Some(kind @ (ErrorKind::Deadlock | ErrorKind::ConcurrencyConflict)) = record.kind
                && absorbed
            {
                recovered(record.attempt + 1, kind, record.elapsed);
            }
        }
        result
    }

    /// Runs the retry loop, optionally under a deadline, and collects stats.
    #[tracing::instrument(
        name = "transaction",
        skip(self, cancel, store, operation),
        fields(max_retries = self.policy.max_retries(), timeout_ms = timeout.map(|t| t.as_millis() as u64))
    )]
    pub(crate) async fn run<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> (RetryStats, TxResult<T>)
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        let started = Instant::now();
        let state = Mutex::new(RetryState::default());
        let attempts = self.attempt_loop(cancel, store, operation_name, operation, started, &state);

        let result = match timeout {
            None => attempts.await,
            Some(limit) => match tokio::time::timeout(limit, attempts).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let mut s = state.lock();
                    if !s.during_backoff {
                        let attempt = s.attempts_started.saturating_sub(1);
                        s.record(attempt, started, None, AttemptOutcome::TimedOut);
                    }
                    if let Some(m) = &self.metrics {
                        m.record_timeout();
                    }
                    tracing::warn!(
                        operation = operation_name,
                        attempts_completed = s.attempts_completed,
                        during_backoff = s.during_backoff,
                        timeout_ms = limit.as_millis() as u64,
                        "transaction timed out",
                    );
                    Err(TxError::Timeout {
                        operation: operation_name.to_owned(),
                        limit,
                        attempts_completed: s.attempts_completed,
                        during_backoff: s.during_backoff,
                    })
                },
            },
        };

        let stats = state.into_inner().into_stats(operation_name, started, &result);
        (stats, result)
    }

    async fn attempt_loop<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        mut operation: F,
        started: Instant,
        state: &Mutex<RetryState>,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        let max_retries = self.policy.max_retries();
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(operation_name, attempt));
            }
            if let Some(observer) = &self.observer {
                observer(attempt + 1, started.elapsed());
            }
            {
                let mut s = state.lock();
                s.attempts_started = attempt + 1;
                s.during_backoff = false;
            }
            if let Some(m) = &self.metrics {
                m.record_attempt();
            }

            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = run_attempt(store, &mut operation) => Some(result),
            };

            let Some(result) = outcome else {
                state.lock().record(attempt, started, None, AttemptOutcome::Cancelled);
                return Err(self.cancelled(operation_name, attempt + 1));
            };
            state.lock().attempts_completed = attempt + 1;

            let err = match result {
                Ok(value) => {
                    state.lock().record(attempt, started, None, AttemptOutcome::Committed);
                    if let Some(m) = &self.metrics {
                        m.record_commit(attempt_started.elapsed());
                    }
                    if attempt > 0 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "transaction committed after retry",
                        );
                    }
                    return Ok(value);
                },
                Err(err) => err,
            };

            let kind = classify(&err);
            if let Some(m) = &self.metrics {
                m.record_failure(kind);
            }

            if !kind.is_retryable() {
                state.lock().record(attempt, started, Some(kind), AttemptOutcome::Failed);
                if let Some(m) = &self.metrics {
                    m.record_non_retryable();
                }
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error_kind = %kind,
                    error = %err,
                    "non-retryable error, giving up",
                );
                return Err(TxError::Failed {
                    operation: operation_name.to_owned(),
                    kind,
                    source: err,
                });
            }

            if attempt >= max_retries {
                state.lock().record(attempt, started, Some(kind), AttemptOutcome::Exhausted);
                if let Some(m) = &self.metrics {
                    m.record_retry_exhausted();
                }
                tracing::warn!(
                    operation = operation_name,
                    attempts = max_attempts,
                    error_kind = %kind,
                    error = %err,
                    "retries exhausted",
                );
                return Err(TxError::RetriesExhausted {
                    operation: operation_name.to_owned(),
                    attempts: attempt + 1,
                    kind,
                    source: err,
                });
            }

            let delay = compute_backoff(&self.policy, attempt);
            {
                let mut s = state.lock();
                s.record(attempt, started, Some(kind), AttemptOutcome::Retrying { delay });
                s.during_backoff = true;
            }
            if let Some(m) = &self.metrics {
                m.record_retry();
            }
            tracing::debug!(
                operation = operation_name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error_kind = %kind,
                error = %err,
                "retryable error, retrying after backoff",
            );

            fail_point!("retry-before-sleep");
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(self.cancelled(operation_name, attempt + 1));
                },
                () = tokio::time::sleep(delay) => {},
            }
            attempt += 1;
        }
    }

    fn cancelled(&self, operation_name: &str, attempts: u32) -> TxError {
        if let Some(m) = &self.metrics {
            m.record_cancellation();
        }
        tracing::debug!(operation = operation_name, attempts, "transaction cancelled");
        TxError::Cancelled { operation: operation_name.to_owned(), attempts }
    }
}

/// One attempt: open, run, then commit or roll back.
async fn run_attempt<S, T, F>(store: &S, operation: &mut F) -> StorageResult<T>
where
    S: StorageBackend + ?Sized,
    T: Send,
    F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
{
    let mut txn = store.transaction().await?;
    match operation(&mut txn).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        },
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed after operation error");
            }
            Err(err)
        },
    }
}
