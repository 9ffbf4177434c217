//! Batching Span Exporter Pipeline
//!
//! A standalone export pipeline for distributed-tracing spans: producers hand
//! finished spans to a [`PipelineHandle`] with a bounded, non-blocking
//! `enqueue`, and a background flush worker ships them in batches to a trace
//! collector over OTLP/HTTP. Export latency is fully decoupled from span
//! production: a slow or unreachable collector never stalls the producer.
//!
//! The pipeline favors freshness over completeness: when the buffer is full
//! the oldest spans are dropped (and counted), and batches that exhaust their
//! retry budget are discarded rather than resent.

pub mod batch;
pub mod exporter;
pub mod otlp;
pub mod pipeline;
pub mod retry;
pub mod span;

// Re-export main types
pub use batch::{BatchBuffer, BatchConfig, BatchMetrics};
pub use exporter::{ExportError, SpanExporter, SpanExporterBoxed};
pub use otlp::{InitError, OtlpHttpExporter};
pub use pipeline::{ExportMetrics, PipelineConfig, PipelineHandle, ShutdownReport, SpanPipeline};
pub use retry::{RetryConfig, RetryingExporter};
pub use span::{AttributeValue, Span, SpanBatch, SpanEvent, SpanKind, SpanStatus};
