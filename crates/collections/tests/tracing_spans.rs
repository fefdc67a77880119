//! Integration test verifying that collection operations open named pipeline
//! spans around the store calls they make.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use stowage_collections::{EventStore, ExpectedVersion, NewEvent, Queue};
use stowage_storage::{MemoryBackend, Store};
use tokio_util::sync::CancellationToken;
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

type Recorded = Arc<Mutex<Vec<(String, Option<String>)>>>;

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Recorded,
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

fn pipeline_operations(spans: &Recorded) -> Vec<String> {
    spans
        .lock()
        .expect("lock poisoned")
        .iter()
        .filter(|(name, _)| name == "pipeline")
        .filter_map(|(_, operation)| operation.clone())
        .collect()
}

#[tokio::test]
async fn queue_append_wraps_its_store_calls() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let queue = Queue::new(Store::builder(MemoryBackend::new()).build());
    queue
        .append("q", Some(Bytes::from("x")), None, &CancellationToken::new())
        .await
        .expect("append");

    let operations = pipeline_operations(&spans);
    assert_eq!(operations.first().map(String::as_str), Some("queue.append"), "{operations:?}");
    assert!(operations.iter().any(|op| op == "get"), "state is read: {operations:?}");
    assert_eq!(operations.iter().filter(|op| *op == "set").count(), 2, "item then state");
}

#[tokio::test]
async fn event_store_append_is_instrumented() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let events = EventStore::new(Store::builder(MemoryBackend::new()).build());
    events
        .append("s", ExpectedVersion::Any, vec![NewEvent::new("t", "d")], &CancellationToken::new())
        .await
        .expect("append");

    let recorded = spans.lock().expect("lock poisoned").clone();
    assert!(recorded.iter().any(|(name, _)| name == "append"), "{recorded:?}");
    assert!(pipeline_operations(&spans).contains(&"event_store.append".to_owned()));
}
