//! End-to-end bridge tests: messages through the handler, spans through the
//! pipeline, batches into a collecting exporter: everything except a live
//! broker and collector.

use mqtt_bridge::bridge::{SpanBridge, MESSAGE_SPAN_NAME};
use mqtt_bridge::transport::{InboundMessage, MessageHandler};
use span_pipeline::{
    AttributeValue, BatchConfig, ExportError, PipelineConfig, Span, SpanBatch, SpanExporter,
    SpanKind, SpanPipeline,
};
use std::sync::Arc;
use std::time::Duration;

struct CollectingExporter {
    spans: std::sync::Mutex<Vec<Span>>,
}

impl CollectingExporter {
    fn new() -> Self {
        Self {
            spans: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn all_spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }
}

impl SpanExporter for CollectingExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.spans.lock().unwrap().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "collecting"
    }
}

fn make_message(topic: &str, payload: &[u8]) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        received_at: span_pipeline::span::unix_nanos_now(),
    }
}

fn fast_pipeline(exporter: Arc<CollectingExporter>) -> SpanPipeline {
    let config = PipelineConfig {
        batch: BatchConfig {
            max_batch_size: 512,
            max_batch_interval: Duration::from_millis(50),
            max_buffer_capacity: 4096,
        },
        flush_tick: Duration::from_millis(10),
        ..Default::default()
    };
    SpanPipeline::with_exporter(config, exporter)
}

#[tokio::test]
async fn test_message_to_exported_span_end_to_end() {
    let exporter = Arc::new(CollectingExporter::new());
    let pipeline = fast_pipeline(exporter.clone());

    // Bridge bound the way the supervisor binds it for ["t1", "t2"]
    let bridge: Arc<dyn MessageHandler> = Arc::new(SpanBridge::new(pipeline.handle(), 1024));

    bridge.on_message(make_message("t1", b"hello"));

    // The next flush boundary carries the span to the collector
    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.shutdown(Duration::from_secs(1)).await;

    let spans = exporter.all_spans();
    assert_eq!(spans.len(), 1, "exactly one span per message");

    let span = &spans[0];
    assert_eq!(span.name, MESSAGE_SPAN_NAME);
    assert_eq!(span.kind, SpanKind::Consumer);
    assert_eq!(span.parent_span_id, 0, "message spans are roots");
    assert_eq!(
        span.attributes.get("transport.topic"),
        Some(&AttributeValue::String("t1".into()))
    );
    assert_eq!(
        span.attributes.get("message.payload"),
        Some(&AttributeValue::String("hello".into()))
    );
    assert!(span.end_time >= span.start_time);
}

#[tokio::test]
async fn test_span_count_matches_message_count_with_failures() {
    let exporter = Arc::new(CollectingExporter::new());
    let pipeline = fast_pipeline(exporter.clone());
    let bridge = Arc::new(SpanBridge::new(pipeline.handle(), 16));

    // Mixed traffic: every third payload blows the attribute cap
    for i in 0..300u32 {
        let payload = if i % 3 == 0 {
            vec![b'x'; 64]
        } else {
            format!("m{}", i).into_bytes()
        };
        bridge.on_message(make_message(&format!("t{}", i % 2 + 1), &payload));
    }

    assert_eq!(bridge.metrics().messages_handled(), 300);
    assert_eq!(
        bridge.metrics().spans_closed(),
        bridge.metrics().messages_handled(),
        "no span may leak open, annotation failures included"
    );
    assert_eq!(bridge.metrics().annotation_failures(), 100);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = pipeline.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.spans_exported, 300);
    assert_eq!(exporter.all_spans().len(), 300);
}

#[tokio::test]
async fn test_per_topic_order_preserved_into_export() {
    let exporter = Arc::new(CollectingExporter::new());
    let pipeline = fast_pipeline(exporter.clone());
    let bridge = Arc::new(SpanBridge::new(pipeline.handle(), 1024));

    for i in 0..100u32 {
        bridge.on_message(make_message("t1", format!("{}", i).as_bytes()));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.shutdown(Duration::from_secs(1)).await;

    // Delivery order survives the buffer: payload sequence is monotonic
    let payloads: Vec<u32> = exporter
        .all_spans()
        .iter()
        .map(|s| match s.attributes.get("message.payload") {
            Some(AttributeValue::String(p)) => p.parse().unwrap(),
            other => panic!("missing payload attribute: {:?}", other),
        })
        .collect();
    let mut sorted = payloads.clone();
    sorted.sort_unstable();
    assert_eq!(payloads, sorted);
    assert_eq!(payloads.len(), 100);
}

#[tokio::test]
async fn test_distinct_trace_ids_per_message() {
    let exporter = Arc::new(CollectingExporter::new());
    let pipeline = fast_pipeline(exporter.clone());
    let bridge = Arc::new(SpanBridge::new(pipeline.handle(), 1024));

    for _ in 0..50 {
        bridge.on_message(make_message("t1", b"x"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    pipeline.shutdown(Duration::from_secs(1)).await;

    let spans = exporter.all_spans();
    let mut trace_ids: Vec<u128> = spans.iter().map(|s| s.trace_id).collect();
    trace_ids.sort_unstable();
    trace_ids.dedup();
    assert_eq!(trace_ids.len(), 50, "each message starts its own trace");
}
