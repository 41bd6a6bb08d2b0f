//! Integration test verifying that `#[instrument]` annotations and retry
//! events produce the expected spans and structured fields.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

use monstera_resilience::{
    BulkConfig, ChunkedRunner, ConcurrencyConfig, ConcurrentTransactionManager, HealthConfig,
    HealthProber, MemoryBackend, RetryPolicy, StorageBackend, TransactionExecutor,
    boxed_operation,
    testutil::{deadlock, fast_policy},
};
use tokio_util::sync::CancellationToken;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records spans and events with their fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SpanRecord {
    name: String,
    parent: Option<String>,
    fields: String,
}

#[derive(Clone, Default)]
struct Collector {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
    events: Arc<Mutex<Vec<String>>>,
}

struct FieldWriter<'a>(&'a mut String);

impl tracing::field::Visit for FieldWriter<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let _ = write!(self.0, "{}={:?} ", field.name(), value);
    }
}

impl<S> tracing_subscriber::Layer<S> for Collector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut fields = String::new();
            attrs.record(&mut FieldWriter(&mut fields));
            self.spans.lock().expect("lock poisoned").push(SpanRecord {
                name: span.name().to_owned(),
                parent: span.parent().map(|p| p.name().to_owned()),
                fields,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut fields = String::new();
        event.record(&mut FieldWriter(&mut fields));
        self.events.lock().expect("lock poisoned").push(fields);
    }
}

fn install() -> (Collector, tracing::subscriber::DefaultGuard) {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (collector, guard)
}

/// Executor spans carry the operation name; the memory store's own
/// `transaction` span does not.
fn executor_spans(collector: &Collector) -> Vec<SpanRecord> {
    collector
        .spans
        .lock()
        .expect("lock poisoned")
        .iter()
        .filter(|s| s.name == "transaction" && s.fields.contains("operation_name="))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn executor_creates_transaction_span() {
    let (collector, _guard) = install();

    let store = MemoryBackend::new();
    TransactionExecutor::new(fast_policy(2))
        .execute(&CancellationToken::new(), &store, "create_user", |txn| {
            Box::pin(async move {
                txn.set(b"user:1".to_vec(), b"alice".to_vec());
                Ok(())
            })
        })
        .await
        .expect("execute should succeed");

    let spans = executor_spans(&collector);
    assert_eq!(spans.len(), 1, "expected one executor span, got: {spans:?}");
    assert!(spans[0].fields.contains("operation_name=\"create_user\""), "{spans:?}");
    assert!(spans[0].fields.contains("max_retries=2"), "{spans:?}");

    let all = collector.spans.lock().expect("lock poisoned");
    assert!(
        all.iter().any(|s| s.name == "transaction" && s.parent.as_deref() == Some("transaction")),
        "store transaction span should nest under the executor span, got: {all:?}"
    );
}

#[tokio::test]
async fn service_executor_prefixes_span_operation_name() {
    let (collector, _guard) = install();

    let store = MemoryBackend::new();
    let (_stats, result) = TransactionExecutor::new(fast_policy(1))
        .for_service("billing")
        .execute_critical(&CancellationToken::new(), &store, "close_invoice", |txn| {
            Box::pin(async move {
                txn.set(b"invoice:1".to_vec(), b"closed".to_vec());
                Ok(())
            })
        })
        .await;
    result.expect("execute should succeed");

    let spans = executor_spans(&collector);
    assert!(
        spans[0].fields.contains("operation_name=\"billing_critical_close_invoice\""),
        "{spans:?}"
    );
    let events = collector.events.lock().expect("lock poisoned");
    assert!(
        events.iter().any(|e| e.contains("service=billing") && e.contains("attempts=1")),
        "missing critical summary event, got: {events:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn retry_emits_structured_backoff_event() {
    let (collector, _guard) = install();

    let policy = RetryPolicy::builder()
        .max_retries(3)
        .base_delay(Duration::from_millis(100))
        .jitter_enabled(false)
        .build()
        .unwrap();
    let store = MemoryBackend::new();
    let mut failures = 1;
    TransactionExecutor::new(policy)
        .execute(&CancellationToken::new(), &store, "transfer", |_txn| {
            let fail = failures > 0;
            failures -= 1;
            Box::pin(async move { if fail { Err(deadlock()) } else { Ok(()) } })
        })
        .await
        .expect("second attempt should succeed");

    let events = collector.events.lock().expect("lock poisoned");
    let backoff = events
        .iter()
        .find(|e| e.contains("retrying after backoff"))
        .unwrap_or_else(|| panic!("missing backoff event, got: {events:?}"));
    assert!(backoff.contains("operation=\"transfer\""), "{backoff}");
    assert!(backoff.contains("attempt=1"), "{backoff}");
    assert!(backoff.contains("max_attempts=4"), "{backoff}");
    assert!(backoff.contains("delay_ms=100"), "{backoff}");
    assert!(backoff.contains("error_kind=deadlock"), "{backoff}");
}

#[tokio::test]
async fn bulk_run_nests_chunk_transactions() {
    let (collector, _guard) = install();

    let store = MemoryBackend::new();
    let runner = ChunkedRunner::new(TransactionExecutor::new(fast_policy(1)), BulkConfig::default());
    runner
        .process_in_chunks(
            &CancellationToken::new(),
            &store,
            "backfill",
            25,
            10,
            |txn, range| {
                Box::pin(async move {
                    txn.set(format!("row:{}", range.offset).into_bytes(), b"x".to_vec());
                    Ok(())
                })
            },
            None,
        )
        .await
        .expect("bulk run should succeed");

    let all = collector.spans.lock().expect("lock poisoned").clone();
    let bulk = all
        .iter()
        .find(|s| s.name == "process_in_chunks")
        .unwrap_or_else(|| panic!("missing bulk span, got: {all:?}"));
    assert!(bulk.fields.contains("total_items=25"), "{bulk:?}");

    let chunks = executor_spans(&collector);
    assert_eq!(chunks.len(), 3, "{chunks:?}");
    assert!(chunks.iter().all(|s| s.parent.as_deref() == Some("process_in_chunks")));
    assert!(chunks[0].fields.contains("backfill[0..10]"), "{chunks:?}");
    assert!(chunks[2].fields.contains("backfill[20..25]"), "{chunks:?}");
}

#[tokio::test]
async fn concurrent_batch_creates_span() {
    let (collector, _guard) = install();

    let manager = ConcurrentTransactionManager::new(
        Arc::new(MemoryBackend::new()),
        TransactionExecutor::new(fast_policy(1)),
        ConcurrencyConfig::default(),
    );
    let operations =
        (0..3).map(|i| boxed_operation(move |_txn| Box::pin(async move { Ok(i) }))).collect();
    let results = manager.execute_concurrent(&CancellationToken::new(), "fanout", operations).await;
    assert!(results.iter().all(Result::is_ok));

    let all = collector.spans.lock().expect("lock poisoned");
    let batch = all
        .iter()
        .find(|s| s.name == "execute_concurrent")
        .unwrap_or_else(|| panic!("missing batch span, got: {all:?}"));
    assert!(batch.fields.contains("operations=3"), "{batch:?}");
}

#[tokio::test]
async fn health_prober_wraps_store_probe() {
    let (collector, _guard) = install();

    let store = MemoryBackend::new();
    let mut prober = HealthProber::new(HealthConfig::default());
    prober.check(&CancellationToken::new(), &store).await.expect("probe should pass");

    let all = collector.spans.lock().expect("lock poisoned");
    assert!(
        all.iter().any(|s| s.name == "health_check" && s.parent.as_deref() == Some("check")),
        "store probe should nest under the prober span, got: {all:?}"
    );
}

#[tokio::test]
async fn memory_backend_operations_produce_distinct_spans() {
    let (collector, _guard) = install();

    let backend = MemoryBackend::new();
    backend.set(b"k".to_vec(), b"v".to_vec()).await.expect("set");
    let _ = backend.get(b"k").await;
    backend.delete(b"k").await.expect("delete");
    let _ = backend.transaction().await;
    let _ = backend.health_check().await;

    let recorded = collector.spans.lock().expect("lock poisoned");
    for name in ["set", "get", "delete", "transaction", "health_check"] {
        assert!(
            recorded.iter().any(|s| s.name == name),
            "missing span '{name}', recorded: {recorded:?}"
        );
    }
}
