//! Chunked bulk processing.
//!
//! [`ChunkedRunner`] splits `total_items` into consecutive `[offset, offset + limit)` ranges and
//! runs each range as its own retried transaction. A chunk that fails, exhausts its retries, times
//! out or is cancelled aborts the run; chunks committed before it stay committed.
//!
//! ```
//! use monstera_resilience::{BulkConfig, ChunkedRunner, MemoryBackend, TransactionExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = MemoryBackend::new();
//! let runner = ChunkedRunner::new(TransactionExecutor::default(), BulkConfig::default());
//!
//! let metrics = runner
//!     .process_in_chunks(&CancellationToken::new(), &store, "archive", 250, 100, |txn, range| {
//!         Box::pin(async move {
//!             for i in range.offset..range.end() {
//!                 txn.set(format!("archived:{i}").into_bytes(), b"1".to_vec());
//!             }
//!             Ok(())
//!         })
//!     }, None)
//!     .await
//!     .unwrap();
//!
//! assert_eq!(metrics.chunk_count(), 3);
//! assert_eq!(store.len(), 250);
//! # });
//! ```

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    config::BulkConfig,
    error::{StorageResult, TxError},
    metrics::BatchMetrics,
    retry::{BoxFuture, TransactionExecutor},
    transaction::Transaction,
};

/// A half-open range of items handled by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChunkRange {
    /// Index of the first item.
    pub offset: usize,
    /// Number of items; never zero.
    pub limit: usize,
}

impl ChunkRange {
    /// One past the last item.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.limit
    }
}

/// Progress callback: `(processed_items, total_items)`.
pub type ProgressFn<'p> = &'p mut (dyn FnMut(usize, usize) + Send);

/// A bulk run stopped at a failing chunk.
#[derive(Debug, Error)]
#[error("{operation}: chunk [{}, {}) failed: {source}", .range.offset, .range.end())]
pub struct ChunkError {
    /// Name of the bulk operation.
    pub operation: String,
    /// The chunk that failed.
    pub range: ChunkRange,
    /// Why it failed.
    #[source]
    pub source: TxError,
    /// Metrics of the run up to and including the failed chunk.
    pub metrics: BatchMetrics,
}

/// Runs bulk operations chunk by chunk through a [`TransactionExecutor`].
#[derive(Debug, Clone)]
pub struct ChunkedRunner {
    executor: TransactionExecutor,
    config: BulkConfig,
}

impl ChunkedRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(executor: TransactionExecutor, config: BulkConfig) -> Self {
        Self { executor, config }
    }

    /// Returns the bulk configuration.
    #[must_use]
    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Processes `total_items` in chunks of `chunk_size` (0 selects the
    /// configured default).
    ///
    /// `per_chunk(txn, range)` is called once per attempt for each chunk and
    /// must be safe to re-run. Each chunk, retries included, is bounded by
    /// [`BulkConfig::chunk_timeout`]. `progress(processed, total)` fires each
    /// time the processed count crosses a multiple of the configured progress
    /// interval (every chunk when unset) and after the final chunk.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError`] for the first chunk that does not commit.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, cancel, store, per_chunk, progress))]
    pub async fn process_in_chunks<S, F>(
        &self,
        cancel: &CancellationToken,
        store: &S,
        operation_name: &str,
        total_items: usize,
        chunk_size: usize,
        mut per_chunk: F,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<BatchMetrics, ChunkError>
    where
        S: StorageBackend + ?Sized,
        F: for<'a> FnMut(&'a mut Box<dyn Transaction>, ChunkRange) -> BoxFuture<'a, StorageResult<()>>
            + Send,
    {
        let chunk_size = if chunk_size == 0 { self.config.chunk_size() } else { chunk_size }.max(1);

        let interval = self.config.progress_interval().unwrap_or(chunk_size).max(1);
        let mut metrics = BatchMetrics::new();
        let mut processed = 0usize;

        tracing::info!(operation = operation_name, total_items, chunk_size, "bulk run started");

        for offset in (0..total_items).step_by(chunk_size) {
            let range = ChunkRange { offset, limit: chunk_size.min(total_items - offset) };
            let chunk_name = format!("{operation_name}[{}..{}]", range.offset, range.end());

            let (stats, result) = self
                .executor
                .run(cancel, store, &chunk_name, Some(self.config.chunk_timeout()), |txn| {
                    per_chunk(txn, range)
                })
                .await;
            metrics.record_retries(u64::from(stats.retries()));

            if let Err(source) = result {
                if source.is_timeout() {
                    metrics.record_timeout();
                }
                metrics.record_failed_chunk(range.limit as u64, &source);
                metrics.finish();
                tracing::warn!(
                    operation = operation_name,
                    offset = range.offset,
                    limit = range.limit,
                    processed,
                    error = %source,
                    "bulk run aborted",
                );
                return Err(ChunkError {
                    operation: operation_name.to_owned(),
                    range,
                    source,
                    metrics,
                });
            }

            metrics.record_processed(range.limit as u64);
            metrics.record_chunk();
            let before = processed;
            processed = range.end();

            let last = processed == total_items;
            if before / interval != processed / interval || last {
                tracing::debug!(
                    operation = operation_name,
                    processed,
                    total_items,
                    "bulk run progress",
                );
                if let Some(report) = progress.as_deref_mut() {
                    report(processed, total_items);
                }
            }
        }

        metrics.finish();
        tracing::info!(
            operation = operation_name,
            processed = metrics.processed_items(),
            chunks = metrics.chunk_count(),
            retries = metrics.retry_count(),
            duration_ms = metrics.duration().as_millis() as u64,
            "bulk run finished",
        );
        Ok(metrics)
    }
}
