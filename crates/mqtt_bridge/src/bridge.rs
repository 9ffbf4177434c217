//! Message-to-Span Bridge
//!
//! The handler invoked once per inbound message. It opens a root span,
//! annotates it with message metadata, ends it, and hands it to the export
//! pipeline, all without blocking the delivery task. Ending the span is
//! unconditional: an annotation failure is recorded on the span and logged,
//! never propagated, because a malformed attribute must not block message
//! handling.

use crate::transport::{InboundMessage, MessageHandler};
use span_pipeline::{AttributeValue, PipelineHandle, Span, SpanKind, SpanStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Name given to every message span.
pub const MESSAGE_SPAN_NAME: &str = "transport-message";

/// Errors annotating a span. Recovered in place; the span still closes.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// Payload too large to record verbatim as an attribute
    #[error("payload of {size} bytes exceeds the {cap} byte attribute cap")]
    PayloadTooLarge { size: usize, cap: usize },
}

/// Per-bridge counters.
///
/// `spans_closed` equals `messages_handled` on every path, annotation
/// failures included.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    messages_handled: AtomicU64,
    spans_closed: AtomicU64,
    annotation_failures: AtomicU64,
}

impl BridgeMetrics {
    pub fn messages_handled(&self) -> u64 {
        self.messages_handled.load(Ordering::Relaxed)
    }

    pub fn spans_closed(&self) -> u64 {
        self.spans_closed.load(Ordering::Relaxed)
    }

    pub fn annotation_failures(&self) -> u64 {
        self.annotation_failures.load(Ordering::Relaxed)
    }
}

/// Turns inbound messages into finished root spans on the export pipeline.
///
/// One bridge is bound per subscription; the pipeline handle is injected at
/// construction rather than reached through any global tracer state.
pub struct SpanBridge {
    pipeline: PipelineHandle,
    span_name: String,
    max_payload_attr_bytes: usize,
    metrics: BridgeMetrics,
}

impl SpanBridge {
    /// Creates a bridge producing spans named [`MESSAGE_SPAN_NAME`].
    pub fn new(pipeline: PipelineHandle, max_payload_attr_bytes: usize) -> Self {
        Self::named(pipeline, MESSAGE_SPAN_NAME, max_payload_attr_bytes)
    }

    /// Creates a bridge with a custom span name (e.g. per-topic naming).
    pub fn named(
        pipeline: PipelineHandle,
        span_name: impl Into<String>,
        max_payload_attr_bytes: usize,
    ) -> Self {
        Self {
            pipeline,
            span_name: span_name.into(),
            max_payload_attr_bytes,
            metrics: BridgeMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    /// Annotates the span with the message metadata.
    ///
    /// Topic, size and arrival time are always recorded; the payload itself
    /// is only recorded verbatim when it fits the attribute cap.
    fn annotate(&self, span: &mut Span, msg: &InboundMessage) -> Result<(), AnnotationError> {
        span.set_attribute(
            "transport.topic",
            AttributeValue::String(msg.topic.clone()),
        );
        span.set_attribute(
            "message.payload_size",
            AttributeValue::Int(msg.payload.len() as i64),
        );
        span.set_attribute(
            "message.received_at",
            AttributeValue::Int(msg.received_at as i64),
        );

        if msg.payload.len() > self.max_payload_attr_bytes {
            return Err(AnnotationError::PayloadTooLarge {
                size: msg.payload.len(),
                cap: self.max_payload_attr_bytes,
            });
        }
        span.set_attribute(
            "message.payload",
            AttributeValue::String(String::from_utf8_lossy(&msg.payload).into_owned()),
        );
        Ok(())
    }
}

impl MessageHandler for SpanBridge {
    fn on_message(&self, msg: InboundMessage) {
        self.metrics.messages_handled.fetch_add(1, Ordering::Relaxed);

        let mut span = Span::new(
            gen_trace_id(),
            gen_span_id(),
            0, // every message is an independent root span
            self.span_name.clone(),
            SpanKind::Consumer,
        );
        span.start_time = msg.received_at;

        if let Err(e) = self.annotate(&mut span, &msg) {
            self.metrics.annotation_failures.fetch_add(1, Ordering::Relaxed);
            let mut attrs = HashMap::new();
            attrs.insert(
                "error.message".to_string(),
                AttributeValue::String(e.to_string()),
            );
            span.add_event("annotation_failure", attrs);
            warn!(topic = %msg.topic, error = %e, "failed to annotate message span");
        }

        // The span closes on every path, annotation failures included
        span.finish(SpanStatus::Ok);
        self.metrics.spans_closed.fetch_add(1, Ordering::Relaxed);

        debug!(
            topic = %msg.topic,
            payload_bytes = msg.payload.len(),
            "message bridged to span"
        );

        self.pipeline.enqueue(span);
    }
}

fn gen_trace_id() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn gen_span_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
