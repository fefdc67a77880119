//! Integration test verifying that pipelines, behaviors and the memory
//! backend produce the expected spans.

#![allow(clippy::expect_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use stowage_storage::{
    Entry, MemoryBackend, StorageBackend, Store,
    behaviors::{RetryBehavior, RetryConfig},
    testutil::{FailingBackend, FailureMode},
};
use tokio_util::sync::CancellationToken;
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer — records span names and their `operation` field
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[derive(Default)]
struct OperationField(Option<String>);

impl Visit for OperationField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "operation" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "operation" {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_owned());
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
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
            let mut operation = OperationField::default();
            attrs.record(&mut operation);
            self.spans.lock().expect("lock poisoned").push((span.name().to_owned(), operation.0));
        }
    }
}

fn collect() -> (SpanCollector, Arc<Mutex<Vec<(String, Option<String>)>>>) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    (collector, spans)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_backend_set_creates_span() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let backend = MemoryBackend::new();
    backend.set(Entry::new("key-1", "value-1")).await.expect("set should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|(name, _)| name == "set"), "expected a 'set' span: {recorded:?}");
}

#[tokio::test]
async fn memory_backend_delete_creates_span() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let backend = MemoryBackend::new();
    backend.delete("key", "").await.expect("delete should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|(name, _)| name == "delete"),
        "expected a 'delete' span, got: {recorded:?}"
    );
}

#[tokio::test]
async fn store_operations_open_pipeline_spans() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let store = Store::builder(MemoryBackend::new()).build();
    let cancel = CancellationToken::new();
    store.set(Entry::new("k", "v"), &cancel).await.expect("set");
    let _ = store.get("k", &cancel).await.expect("get");
    let _ = store.features(&cancel).await.expect("features");

    let recorded = spans.lock().expect("lock poisoned");
    let pipelines: Vec<_> = recorded
        .iter()
        .filter(|(name, _)| name == "pipeline")
        .filter_map(|(_, operation)| operation.clone())
        .collect();
    assert_eq!(pipelines, vec!["set", "get", "features"], "got: {recorded:?}");
}

#[tokio::test]
async fn retry_behavior_opens_a_span_per_invocation() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let backend = FailingBackend::new(MemoryBackend::new(), FailureMode::Transient(1));
    let config = RetryConfig::builder()
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .expect("valid config");
    let store = Store::builder(backend).layer(Arc::new(RetryBehavior::new(config))).build();
    store.get("k", &CancellationToken::new()).await.expect("second attempt succeeds");

    let recorded = spans.lock().expect("lock poisoned");
    let retries: Vec<_> = recorded.iter().filter(|(name, _)| name == "retry").collect();
    assert_eq!(retries.len(), 1, "one retry span wraps every attempt: {recorded:?}");
    assert_eq!(retries[0].1.as_deref(), Some("get"));
}
