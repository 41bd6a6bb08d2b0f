//! Service-scoped execution.
//!
//! A [`ServiceExecutor`] is a [`TransactionExecutor`] bound to a service name.
//! Every operation it runs is named `{service}_{operation}`, so logs, spans
//! and [`RetryStats`] group by owning service without each call site
//! formatting names by hand. [`TransactionKind`] selects how a call is driven.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    error::{StorageResult, TxResult},
    retry::{BoxFuture, RetryStats, TransactionExecutor},
    transaction::Transaction,
};

/// How a service-level call is driven through the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Plain retried execution.
    #[default]
    Standard,
    /// Retried execution whose [`RetryStats`] are logged when the call ends.
    Critical,
    /// One unit of a larger batch job.
    Batch,
}

impl TransactionKind {
    fn label(self) -> Option<&'static str> {
        match self {
            Self::Standard => None,
            Self::Critical => Some("critical"),
            Self::Batch => Some("batch"),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label().unwrap_or("standard"))
    }
}

/// A [`TransactionExecutor`] that prefixes operation names with a service name.
///
/// Created with [`TransactionExecutor::for_service`]. Clones share the
/// executor's metrics and observer.
///
/// ```
/// use monstera_resilience::{MemoryBackend, TransactionExecutor};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryBackend::new();
/// let billing = TransactionExecutor::default().for_service("billing");
///
/// let (stats, result) = billing
///     .execute_critical(&CancellationToken::new(), &store, "close_invoice", |txn| {
///         Box::pin(async move {
///             txn.set(b"invoice:9".to_vec(), b"closed".to_vec());
///             Ok(())
///         })
///     })
///     .await;
///
/// assert!(result.is_ok());
/// assert_eq!(stats.operation, "billing_critical_close_invoice");
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ServiceExecutor {
    executor: TransactionExecutor,
    service: Arc<str>,
}

impl TransactionExecutor {
    /// Binds a clone of this executor to `service`.
    #[must_use]
    pub fn for_service(&self, service: impl Into<String>) -> ServiceExecutor {
        ServiceExecutor { executor: self.clone(), service: Arc::from(service.into()) }
    }
}

impl ServiceExecutor {
    /// The service name used as prefix.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The underlying executor.
    #[must_use]
    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    /// The full operation name used for `operation` under `kind`.
    #[must_use]
    pub fn operation_name(&self, kind: TransactionKind, operation: &str) -> String {
        match kind.label() {
            None => format!("{}_{operation}", self.service),
            Some(label) => format!("{}_{label}_{operation}", self.service),
        }
    }

    /// Runs `operation` as a [`Standard`](TransactionKind::Standard) transaction.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionExecutor::execute`].
    pub async fn execute<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation: &str,
        op: F,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        let name = self.operation_name(TransactionKind::Standard, operation);
        self.executor.execute(cancel, store, &name, op).await
    }

    /// Runs `operation` under an overall deadline.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionExecutor::execute_with_timeout`].
    pub async fn execute_with_timeout<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        timeout: Duration,
        operation: &str,
        op: F,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        let name = self.operation_name(TransactionKind::Standard, operation);
        self.executor.execute_with_timeout(cancel, store, timeout, &name, op).await
    }

    /// Runs `operation` as a [`Critical`](TransactionKind::Critical)
    /// transaction and returns its stats alongside the result.
    pub async fn execute_critical<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation: &str,
        op: F,
    ) -> (RetryStats, TxResult<T>)
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        let name = self.operation_name(TransactionKind::Critical, operation);
        let (stats, result) = self.executor.execute_with_stats(cancel, store, &name, op).await;
        tracing::info!(
            service = %self.service,
            operation = %stats.operation,
            attempts = stats.attempts,
            retries = stats.retries(),
            total_ms = stats.total_duration.as_millis() as u64,
            ok = result.is_ok(),
            "critical transaction finished",
        );
        (stats, result)
    }

    /// Runs `operation` the way `kind` prescribes, discarding stats.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionExecutor::execute`].
    pub async fn execute_as<S, T, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        kind: TransactionKind,
        operation: &str,
        op: F,
    ) -> TxResult<T>
    where
        S: StorageBackend + ?Sized,
        T: Send,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>) -> BoxFuture<'a, StorageResult<T>> + Send,
    {
        match kind {
            TransactionKind::Critical => self.execute_critical(cancel, store, operation, op).await.1,
            TransactionKind::Standard | TransactionKind::Batch => {
                let name = self.operation_name(kind, operation);
                self.executor.execute(cancel, store, &name, op).await
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::*;
    use crate::{
        classify::ErrorKind, error::TxError, memory::MemoryBackend, metrics::Metrics,
        testutil::{deadlock, fast_policy, flaky_operation},
    };

    #[rstest]
    #[case(TransactionKind::Standard, "payroll_run_month")]
    #[case(TransactionKind::Critical, "payroll_critical_run_month")]
    #[case(TransactionKind::Batch, "payroll_batch_run_month")]
    fn test_operation_names(#[case] kind: TransactionKind, #[case] expected: &str) {
        let payroll = TransactionExecutor::default().for_service("payroll");
        assert_eq!(payroll.operation_name(kind, "run_month"), expected);
    }

    #[test]
    fn test_kind_deserializes_snake_case() {
        let kind: TransactionKind = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(kind, TransactionKind::Critical);
        assert_eq!(TransactionKind::default().to_string(), "standard");
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_returns_stats_under_prefixed_name() {
        let store = MemoryBackend::new();
        let billing = TransactionExecutor::new(fast_policy(3)).for_service("billing");
        let (operation, calls) = flaky_operation(1, deadlock(), b"invoice:1".to_vec(), b"x".to_vec());

        let (stats, result) =
            billing.execute_critical(&CancellationToken::new(), &store, "close_invoice", operation).await;

        assert!(result.is_ok());
        assert_eq!(stats.operation, "billing_critical_close_invoice");
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.errors, vec![ErrorKind::Deadlock]);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[rstest]
    #[case(TransactionKind::Standard, "crm_merge_contacts")]
    #[case(TransactionKind::Critical, "crm_critical_merge_contacts")]
    #[case(TransactionKind::Batch, "crm_batch_merge_contacts")]
    #[tokio::test(start_paused = true)]
    async fn test_execute_as_uses_kind_name(#[case] kind: TransactionKind, #[case] expected: &str) {
        let store = MemoryBackend::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let crm = TransactionExecutor::new(fast_policy(2)).for_service("crm");

        let result = crm
            .execute_as(&CancellationToken::new(), &store, kind, "merge_contacts", move |_txn| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().unwrap().push(());
                    Err::<(), _>(deadlock())
                })
            })
            .await;

        let err = result.unwrap_err();
        assert!(
            matches!(&err, TxError::RetriesExhausted { operation, attempts: 3, .. } if operation == expected),
            "{err:?}"
        );
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_service_operation() {
        let store = MemoryBackend::new();
        let reports = TransactionExecutor::new(fast_policy(0)).for_service("reports");

        let err = reports
            .execute_with_timeout(
                &CancellationToken::new(),
                &store,
                Duration::from_millis(50),
                "rebuild",
                |_txn| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(())
                    })
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Timeout { ref operation, .. } if operation == "reports_rebuild"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_executors_share_metrics() {
        let store = MemoryBackend::new();
        let metrics = Metrics::new();
        let executor = TransactionExecutor::new(fast_policy(1)).with_metrics(metrics.clone());
        let cancel = CancellationToken::new();

        for service in ["billing", "payroll"] {
            let scoped = executor.for_service(service);
            assert_eq!(scoped.service(), service);
            scoped
                .execute(&cancel, &store, "touch", |txn| {
                    Box::pin(async move {
                        txn.set(b"touched".to_vec(), b"1".to_vec());
                        Ok(())
                    })
                })
                .await
                .unwrap();
        }

        assert_eq!(metrics.snapshot().commits, 2);
    }
}
