//! Bounded-concurrency execution of independent transactions.
//!
//! [`ConcurrentTransactionManager`] feeds a batch of operations through a
//! bounded queue to a fixed pool of tokio tasks. Each worker drives one
//! operation at a time through the shared [`TransactionExecutor`], so the
//! number of open transactions never exceeds
//! [`ConcurrencyConfig::max_workers`]. Results come back in submission order.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    config::ConcurrencyConfig,
    error::{TxError, TxResult},
    retry::{BoxedOperation, TransactionExecutor},
};

/// Runs batches of transactional operations on a bounded worker pool.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use monstera_resilience::{
///     ConcurrencyConfig, ConcurrentTransactionManager, MemoryBackend, TransactionExecutor,
///     boxed_operation,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let manager = ConcurrentTransactionManager::new(
///     Arc::new(MemoryBackend::new()),
///     TransactionExecutor::default(),
///     ConcurrencyConfig::default(),
/// );
///
/// let operations = (0..3u32)
///     .map(|i| {
///         boxed_operation(move |txn| {
///             Box::pin(async move {
///                 txn.set(format!("user:{i}").into_bytes(), b"active".to_vec());
///                 Ok(i)
///             })
///         })
///     })
///     .collect();
///
/// let results = manager.execute_concurrent(&CancellationToken::new(), "activate", operations).await;
/// let ids: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
/// assert_eq!(ids, vec![0, 1, 2]);
/// # });
/// ```
pub struct ConcurrentTransactionManager<S: ?Sized> {
    store: Arc<S>,
    executor: TransactionExecutor,
    config: ConcurrencyConfig,
}

impl<S: ?Sized> Clone for ConcurrentTransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for ConcurrentTransactionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentTransactionManager")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> ConcurrentTransactionManager<S>
where
    S: StorageBackend + ?Sized + 'static,
{
    /// Creates a manager over a shared store handle.
    #[must_use]
    pub fn new(store: Arc<S>, executor: TransactionExecutor, config: ConcurrencyConfig) -> Self {
        Self { store, executor, config }
    }

    /// Returns the store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the executor each worker runs operations through.
    #[must_use]
    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    /// Returns the concurrency configuration.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Runs every operation in its own retried transaction, at most
    /// `max_workers` at a time.
    ///
    /// `results[i]` is the outcome of `operations[i]` whatever order they
    /// finish in. The call returns once every worker has exited.
    ///
    /// When `cancel` fires, operations not yet handed to the queue report
    /// [`TxError::Cancelled`] with zero attempts, queued ones are cancelled by
    /// the executor before their first attempt, and in-flight ones end through
    /// the executor's cancellation path. An operation whose worker panicked
    /// reports [`TxError::WorkerLost`].
    #[tracing::instrument(skip(self, cancel, operations), fields(operations = operations.len()))]
    pub async fn execute_concurrent<T>(
        &self,
        cancel: &CancellationToken,
        operation_name: &str,
        operations: Vec<BoxedOperation<T>>,
    ) -> Vec<TxResult<T>>
    where
        T: Send + 'static,
    {
        let total = operations.len();
        if total == 0 {
            return Vec::new();
        }

        let max_workers = self.config.max_workers().max(1);
        let workers = max_workers.min(total);
        let (job_tx, job_rx) = mpsc::channel::<(usize, BoxedOperation<T>)>(2 * max_workers);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, TxResult<T>)>();

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let store = Arc::clone(&self.store);
            let executor = self.executor.clone();
            let cancel = cancel.clone();
            let name = operation_name.to_owned();

            tasks.spawn(async move {
                let mut handled = 0usize;
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some((index, operation)) = next else { break };
                    let result = executor
                        .execute(&cancel, store.as_ref(), &format!("{name}[{index}]"), operation)
                        .await;
                    handled += 1;
                    if results.send((index, result)).is_err() {
                        break;
                    }
                }
                tracing::trace!(worker, handled, "worker exited");
            });
        }
        drop(job_rx);
        drop(result_tx);

        let mut fed = 0usize;
        let mut feeding_cancelled = false;
        for (index, operation) in operations.into_iter().enumerate() {
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    feeding_cancelled = true;
                    false
                },
                sent = job_tx.send((index, operation)) => sent.is_ok(),
            };
            if !sent {
                break;
            }
            fed += 1;
        }
        drop(job_tx);

        let mut slots: Vec<Option<TxResult<T>>> = std::iter::repeat_with(|| None).take(total).collect();
        while let Some((index, result)) = result_rx.recv().await {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(operation = operation_name, error = %err, "transaction worker panicked");
            }
        }

        let results: Vec<TxResult<T>> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(result) => result,
                None if feeding_cancelled && index >= fed => {
                    Err(TxError::Cancelled { operation: format!("{operation_name}[{index}]"), attempts: 0 })
                },
                None => Err(TxError::WorkerLost { index }),
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(
            operation = operation_name,
            total,
            workers,
            succeeded,
            failed = total - succeeded,
            "concurrent batch finished",
        );
        results
    }
}
