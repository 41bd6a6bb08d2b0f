//! Operation metrics.
//!
//! Two collectors live here:
//!
//! - [`BatchMetrics`] - a plain, single-owner record of one bulk run: items processed and failed,
//!   retries, timeouts, chunks and error details, with derived duration, throughput and success
//!   rate. The [chunked runner](crate::bulk::ChunkedRunner) fills one in per run.
//! - [`Metrics`] - lock-free process-level counters shared by every
//!   [executor](crate::retry::TransactionExecutor) that is given a handle to it.
//!
//! # Memory Ordering Strategy
//!
//! All atomic operations on [`Metrics`] use `Ordering::Relaxed`. Each counter
//! is independent and monotonically increasing, so `Relaxed` gives atomic
//! increments. `snapshot()` reads counters one after another and may observe
//! them slightly out of step with each other, which is acceptable for
//! telemetry.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use monstera_resilience::{ErrorKind, metrics::Metrics};
//!
//! let metrics = Metrics::new();
//! metrics.record_attempt();
//! metrics.record_failure(ErrorKind::Deadlock);
//! metrics.record_retry();
//! metrics.record_attempt();
//! metrics.record_commit(Duration::from_millis(3));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.attempts, 2);
//! assert_eq!(snapshot.commits, 1);
//! assert_eq!(snapshot.failures_by_kind.get(&ErrorKind::Deadlock), Some(&1));
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::classify::ErrorKind;

/// Number of commit latency samples retained for percentiles.
const DEFAULT_HISTOGRAM_WINDOW_SIZE: usize = 1024;

// ── BatchMetrics ────────────────────────────────────────────────────────

/// Metrics for a single bulk run.
///
/// Timing uses [`tokio::time::Instant`] so runs under a paused test clock
/// report deterministic durations.
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    start: Instant,
    end: Option<Instant>,
    processed_items: u64,
    failed_items: u64,
    retry_count: u64,
    chunk_count: u64,
    timeout_count: u64,
    error_details: Vec<String>,
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchMetrics {
    /// Starts a new record at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            end: None,
            processed_items: 0,
            failed_items: 0,
            retry_count: 0,
            chunk_count: 0,
            timeout_count: 0,
            error_details: Vec::new(),
        }
    }

    /// Records `items` successfully processed items.
    pub fn record_processed(&mut self, items: u64) {
        self.processed_items += items;
    }

    /// Records one failed item and its error text.
    pub fn record_error(&mut self, error: impl std::fmt::Display) {
        self.failed_items += 1;
        self.error_details.push(error.to_string());
    }

    /// Records a whole failed chunk: `items` failed items, one error entry.
    pub fn record_failed_chunk(&mut self, items: u64, error: impl std::fmt::Display) {
        self.failed_items += items;
        self.error_details.push(error.to_string());
    }

    /// Records one retry.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Records `retries` retries at once.
    pub fn record_retries(&mut self, retries: u64) {
        self.retry_count += retries;
    }

    /// Records one timeout.
    pub fn record_timeout(&mut self) {
        self.timeout_count += 1;
    }

    /// Records one processed chunk.
    pub fn record_chunk(&mut self) {
        self.chunk_count += 1;
    }

    /// Stamps the end instant. Later calls move it forward.
    pub fn finish(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Returns `true` once [`finish`](Self::finish) has been called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// Elapsed time from start to end, or to now if not finished.
    #[must_use]
    pub fn duration(&self) -> Duration {
        let end = self.end.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.start)
    }

    /// Processed items per second; `0.0` when no time has elapsed.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.processed_items as f64 / secs
    }

    /// Percentage of items that succeeded; `0.0` when nothing was recorded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.processed_items + self.failed_items;
        if total == 0 {
            return 0.0;
        }
        self.processed_items as f64 / total as f64 * 100.0
    }

    /// Items processed so far.
    #[must_use]
    pub fn processed_items(&self) -> u64 {
        self.processed_items
    }

    /// Items that failed.
    #[must_use]
    pub fn failed_items(&self) -> u64 {
        self.failed_items
    }

    /// Retries absorbed across all chunks.
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        self.retry_count
    }

    /// Chunks completed.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Chunks that hit their time limit.
    #[must_use]
    pub fn timeout_count(&self) -> u64 {
        self.timeout_count
    }

    /// Error text for every recorded failure, in order.
    #[must_use]
    pub fn error_details(&self) -> &[String] {
        &self.error_details
    }

    /// Serializable summary for logs and dashboards.
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            duration: self.duration(),
            processed_items: self.processed_items,
            failed_items: self.failed_items,
            retry_count: self.retry_count,
            timeout_count: self.timeout_count,
            chunk_count: self.chunk_count,
            throughput_per_sec: self.throughput(),
            success_rate_percent: self.success_rate(),
        }
    }
}

/// Point-in-time summary of a [`BatchMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Elapsed run time.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Items processed.
    pub processed_items: u64,
    /// Items failed.
    pub failed_items: u64,
    /// Retries absorbed.
    pub retry_count: u64,
    /// Chunk timeouts.
    pub timeout_count: u64,
    /// Chunks completed.
    pub chunk_count: u64,
    /// Items per second.
    pub throughput_per_sec: f64,
    /// Percentage of items that succeeded.
    pub success_rate_percent: f64,
}

// ── LatencyHistogram ────────────────────────────────────────────────────

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyPercentiles {
    /// 50th percentile (median).
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

/// Bounded sliding window of recent latency samples.
struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HistogramInner {
                buf: Vec::with_capacity(capacity),
                pos: 0,
                capacity: capacity.max(1),
            }),
        }
    }

    fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % inner.capacity;
    }

    fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted = self.inner.lock().buf.clone();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.pos = 0;
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len - 1)
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Snapshot of [`Metrics`] for export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Attempts started.
    pub attempts: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Retries scheduled after a retryable failure.
    pub retries: u64,
    /// Invocations that ran out of attempts.
    pub retries_exhausted: u64,
    /// Invocations that failed with a non-retryable error.
    pub non_retryable_failures: u64,
    /// Invocations ended by cancellation.
    pub cancellations: u64,
    /// Invocations ended by a deadline.
    pub timeouts: u64,
    /// Failed attempts by classification. Kinds never seen are omitted.
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
    /// Attempt-to-commit latency percentiles.
    pub commit_latency: LatencyPercentiles,
}

impl MetricsSnapshot {
    /// Fraction of attempts that committed; `0.0` with no attempts.
    #[must_use]
    pub fn commit_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.commits as f64 / self.attempts as f64
    }

    /// Total failed attempts across all kinds.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures_by_kind.values().sum()
    }
}

/// Process-level retry counters.
///
/// Cloning is cheap; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    attempts: AtomicU64,
    commits: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    non_retryable_failures: AtomicU64,
    cancellations: AtomicU64,
    timeouts: AtomicU64,
    failures_by_kind: [AtomicU64; ErrorKind::ALL.len()],
    commit_histogram: LatencyHistogram,
}

impl Metrics {
    /// Creates a new collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                attempts: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                retries_exhausted: AtomicU64::new(0),
                non_retryable_failures: AtomicU64::new(0),
                cancellations: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                failures_by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
                commit_histogram: LatencyHistogram::new(DEFAULT_HISTOGRAM_WINDOW_SIZE),
            }),
        }
    }

    /// Records the start of an attempt.
    pub fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful commit and how long the committing attempt took.
    pub fn record_commit(&self, attempt_duration: Duration) {
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(attempt_duration.as_micros()).unwrap_or(u64::MAX);
        self.inner.commit_histogram.record(micros);
    }

    /// Records a failed attempt of the given kind.
    pub fn record_failure(&self, kind: ErrorKind) {
        self.inner.failures_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an invocation that used up every attempt.
    pub fn record_retry_exhausted(&self) {
        self.inner.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an invocation that stopped on a non-retryable error.
    pub fn record_non_retryable(&self) {
        self.inner.non_retryable_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an invocation ended by cancellation.
    pub fn record_cancellation(&self) {
        self.inner.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an invocation ended by a deadline.
    pub fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let failures_by_kind = ErrorKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = inner.failures_by_kind[kind.index()].load(Ordering::Relaxed);
                (count > 0).then_some((*kind, count))
            })
            .collect();

        MetricsSnapshot {
            attempts: inner.attempts.load(Ordering::Relaxed),
            commits: inner.commits.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            retries_exhausted: inner.retries_exhausted.load(Ordering::Relaxed),
            non_retryable_failures: inner.non_retryable_failures.load(Ordering::Relaxed),
            cancellations: inner.cancellations.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            failures_by_kind,
            commit_latency: inner.commit_histogram.percentiles(),
        }
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.attempts,
            &inner.commits,
            &inner.retries,
            &inner.retries_exhausted,
            &inner.non_retryable_failures,
            &inner.cancellations,
            &inner.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &inner.failures_by_kind {
            counter.store(0, Ordering::Relaxed);
        }
        inner.commit_histogram.reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot()).finish()
    }
}
