//! Contention stress tests for the retry executor and worker pool.
//!
//! These tests run many transactions against one hot key on a multi-threaded
//! runtime to detect lost updates, leaked transactions, and retry storms. The
//! heavier ones are ignored by default for CI runtime control:
//!
//! ```bash
//! cargo test -p monstera-resilience --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use monstera_resilience::{
    BoxedOperation, ConcurrencyConfig, ConcurrentTransactionManager, ErrorKind, MemoryBackend,
    Metrics, RetryPolicy, StorageBackend, StorageError, TransactionExecutor, boxed_operation,
    classify,
};
use tokio::{sync::Barrier, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of single-winner rounds.
const ROUNDS: usize = 50;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn contention_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(100)
        .base_delay(Duration::from_micros(200))
        .max_delay(Duration::from_millis(10))
        .multiplier(1.5)
        .jitter_factor(0.5)
        .build()
        .unwrap()
}

fn parse_counter(raw: Option<bytes::Bytes>) -> Result<u64, StorageError> {
    match raw {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StorageError::internal("counter is not a number")),
    }
}

fn increment(key: &'static [u8]) -> BoxedOperation<u64> {
    boxed_operation(move |txn| {
        Box::pin(async move {
            let next = parse_counter(txn.get(key).await?)? + 1;
            tokio::task::yield_now().await;
            txn.set(key.to_vec(), next.to_string().into_bytes());
            Ok(next)
        })
    })
}

async fn read_counter(store: &MemoryBackend, key: &[u8]) -> u64 {
    parse_counter(store.get(key).await.expect("get should succeed")).expect("counter")
}

// ---------------------------------------------------------------------------
// Test: Raw transactions: exactly one winner per round
// ---------------------------------------------------------------------------

/// In each round every task reads the hot key, waits until all tasks have
/// read it, then writes and commits. Exactly one commit may succeed; every
/// other task must see a serialization failure.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn raw_transactions_single_winner_per_round() {
    let store = MemoryBackend::new();

    for round in 0..ROUNDS {
        let barrier = Arc::new(Barrier::new(CONCURRENCY));
        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            set.spawn(async move {
                let mut txn = store.transaction().await.expect("begin");
                let _ = txn.get(b"hot").await.expect("read");
                barrier.wait().await;
                txn.set(b"hot".to_vec(), format!("round{round}-task{task_id}").into_bytes());
                txn.commit().await
            });
        }

        let mut winners = 0usize;
        while let Some(result) = set.join_next().await {
            match result.expect("task should not panic") {
                Ok(()) => winners += 1,
                Err(err) => assert_eq!(
                    classify(&err),
                    ErrorKind::ConcurrencyConflict,
                    "round {round}: unexpected error {err}"
                ),
            }
        }
        assert_eq!(winners, 1, "round {round}: exactly one commit should succeed");
    }
    assert_eq!(store.open_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Test: Executor absorbs contention without lost updates
// ---------------------------------------------------------------------------

/// `CONCURRENCY` tasks each increment the same counter through the executor.
/// Every increment must land exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_increments_are_not_lost() {
    let store = MemoryBackend::new();
    let metrics = Metrics::new();
    let executor = TransactionExecutor::new(contention_policy()).with_metrics(metrics.clone());
    let cancel = CancellationToken::new();

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let store = store.clone();
        let executor = executor.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            executor
                .execute(&cancel, &store, &format!("increment-{task_id}"), increment(b"counter"))
                .await
        });
    }

    let mut seen = Vec::new();
    while let Some(result) = set.join_next().await {
        seen.push(result.expect("task should not panic").expect("increment should commit"));
    }
    seen.sort_unstable();

    let expected: Vec<u64> = (1..=CONCURRENCY as u64).collect();
    assert_eq!(seen, expected, "each increment should observe a distinct value");
    assert_eq!(read_counter(&store, b"counter").await, CONCURRENCY as u64);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.commits, CONCURRENCY as u64);
    assert_eq!(snapshot.retries, store.conflict_count());
    assert_eq!(store.open_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Test: Worker pool under sustained contention
// ---------------------------------------------------------------------------

/// A large batch of increments through the worker pool, mixed with
/// increments of independent keys that never conflict.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn worker_pool_sustained_contention() {
    const OPERATIONS: usize = 400;

    let store = Arc::new(MemoryBackend::new());
    let manager = ConcurrentTransactionManager::new(
        Arc::clone(&store),
        TransactionExecutor::new(contention_policy()).with_metrics(Metrics::new()),
        ConcurrencyConfig::builder().max_workers(8).build().unwrap(),
    );

    let operations = (0..OPERATIONS)
        .map(|i| if i % 2 == 0 { increment(b"hot") } else { increment(b"cold") })
        .collect();
    let results = manager.execute_concurrent(&CancellationToken::new(), "sustained", operations).await;

    assert_eq!(results.len(), OPERATIONS);
    assert!(results.iter().all(Result::is_ok), "every operation should commit");
    assert_eq!(read_counter(&store, b"hot").await, (OPERATIONS / 2) as u64);
    assert_eq!(read_counter(&store, b"cold").await, (OPERATIONS / 2) as u64);

    let snapshot = manager.executor().metrics().unwrap().snapshot();
    assert_eq!(snapshot.commits, OPERATIONS as u64);
    assert_eq!(snapshot.retries_exhausted, 0);
    assert_eq!(store.open_transactions(), 0);
}

// ---------------------------------------------------------------------------
// Test: Cancellation mid-batch leaves no open transactions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_batch_releases_transactions() {
    let store = Arc::new(MemoryBackend::new());
    let manager = ConcurrentTransactionManager::new(
        Arc::clone(&store),
        TransactionExecutor::new(contention_policy()),
        ConcurrencyConfig::builder().max_workers(4).build().unwrap(),
    );
    let cancel = CancellationToken::new();

    let operations: Vec<BoxedOperation<()>> = (0..64)
        .map(|i| {
            boxed_operation(move |txn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    txn.set(format!("slow:{i}").into_bytes(), b"1".to_vec());
                    Ok(())
                })
            })
        })
        .collect();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let results = manager.execute_concurrent(&cancel, "slow", operations).await;

    let committed = results.iter().filter(|r| r.is_ok()).count();
    let cancelled = results.iter().filter(|r| matches!(r, Err(e) if e.is_cancelled())).count();
    assert_eq!(committed + cancelled, 64, "every slot is either committed or cancelled");
    assert!(cancelled > 0, "cancellation should stop part of the batch");
    assert_eq!(store.len(), committed);
    assert_eq!(store.open_transactions(), 0);
}
