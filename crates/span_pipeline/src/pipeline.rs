//! Async Export Pipeline
//!
//! Owns the shared batch buffer and the background flush worker. Producers
//! append through a cheap cloneable [`PipelineHandle`]; the worker wakes on a
//! size nudge or a periodic tick, takes the due batch, and exports it off the
//! producer's execution context. Shutdown drains the buffer with an explicit
//! deadline and reports what could not be flushed in time.
//!
//! The buffer mutex is held only for O(1) queue operations, never across an
//! `.await`, so enqueue latency is bounded no matter how slow or unreachable
//! the collector is.

use crate::batch::{BatchBuffer, BatchConfig, BatchMetrics};
use crate::exporter::SpanExporterBoxed;
use crate::otlp::{InitError, OtlpHttpExporter};
use crate::retry::{RetryConfig, RetryingExporter};
use crate::span::Span;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Configuration for the export pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batch buffer configuration
    pub batch: BatchConfig,
    /// Worker wake interval; a safety net under the size nudge and the
    /// trigger for interval-based flushes
    pub flush_tick: Duration,
    /// Per-request timeout applied to each export attempt
    pub request_timeout: Duration,
    /// Retry policy for failed exports. Applied by [`SpanPipeline::init`];
    /// [`SpanPipeline::with_exporter`] takes a pre-composed chain instead.
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            flush_tick: Duration::from_millis(200),
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Thread-safe export accounting (shared between worker and observers)
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Total spans exported successfully
    spans_exported: AtomicU64,
    /// Total batches exported successfully
    batches_exported: AtomicU64,
    /// Total export failures (after retry exhaustion)
    export_errors: AtomicU64,
    /// Total spans dropped because their batch failed to export
    spans_failed: AtomicU64,
}

impl ExportMetrics {
    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn spans_failed(&self) -> u64 {
        self.spans_failed.load(Ordering::Relaxed)
    }

    fn record_success(&self, span_count: u64) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, span_count: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.spans_failed.fetch_add(span_count, Ordering::Relaxed);
    }
}

/// Final accounting returned by [`SpanPipeline::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Spans exported over the pipeline's lifetime
    pub spans_exported: u64,
    /// Spans never exported: buffer overflow + failed batches + unflushed
    pub spans_dropped: u64,
    /// Subset of `spans_dropped` still buffered or in flight when the
    /// shutdown deadline expired
    pub spans_unflushed: u64,
}

struct Shared {
    buffer: Mutex<BatchBuffer>,
    flush_notify: Notify,
    export_metrics: ExportMetrics,
}

/// Cheap cloneable producer handle. The bridge holds one of these and calls
/// [`PipelineHandle::enqueue`] from the message-delivery context.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Appends a finished span to the current batch.
    ///
    /// O(1) and non-blocking: at worst the oldest buffered span is evicted.
    /// If the batch just reached its size threshold the flush worker is
    /// nudged, but this call returns immediately either way.
    pub fn enqueue(&self, span: Span) {
        let flush_due = {
            let mut buffer = self.shared.buffer.lock().unwrap();
            buffer.push(span)
        };
        if flush_due {
            self.shared.flush_notify.notify_one();
        }
    }

    /// Returns the number of spans currently buffered
    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().unwrap().len()
    }

    /// Snapshot of the buffer-side metrics
    pub fn batch_metrics(&self) -> BatchMetrics {
        self.shared.buffer.lock().unwrap().metrics().clone()
    }

    /// Export-side metrics
    pub fn export_metrics(&self) -> &ExportMetrics {
        &self.shared.export_metrics
    }
}

/// The export pipeline: buffer + flush worker + exporter chain.
pub struct SpanPipeline {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<Duration>>,
}

impl SpanPipeline {
    /// Builds the standard OTLP/HTTP export chain (retry over OTLP) and
    /// starts the pipeline.
    ///
    /// Fails only on construction problems (malformed endpoint, client
    /// build); collector reachability is a runtime concern handled by
    /// retry+drop.
    pub fn init(
        collector_endpoint: &str,
        service_name: &str,
        config: PipelineConfig,
    ) -> Result<Self, InitError> {
        let otlp = OtlpHttpExporter::new(collector_endpoint, service_name, config.request_timeout)?;
        let exporter: Arc<dyn SpanExporterBoxed> =
            Arc::new(RetryingExporter::new(otlp, config.retry.clone()));
        Ok(Self::with_exporter(config, exporter))
    }

    /// Starts the pipeline over an arbitrary exporter (used by tests and by
    /// callers composing their own chain).
    pub fn with_exporter(config: PipelineConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(BatchBuffer::new(config.batch.clone())),
            flush_notify: Notify::new(),
            export_metrics: ExportMetrics::default(),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<Duration>();

        let worker_shared = Arc::clone(&shared);
        let flush_tick = config.flush_tick;
        let worker = tokio::spawn(async move {
            let mut tick = tokio::time::interval(flush_tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        flush_if_due(&worker_shared, exporter.as_ref()).await;
                    }

                    () = worker_shared.flush_notify.notified() => {
                        flush_if_due(&worker_shared, exporter.as_ref()).await;
                    }

                    grace = &mut shutdown_rx => {
                        let grace = grace.unwrap_or_default();
                        final_flush(&worker_shared, exporter.as_ref(), grace).await;
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            worker: Some(worker),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Returns a producer handle
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Flushes any partial batch and stops the worker, waiting at most
    /// `timeout`. Spans not flushed within the deadline are discarded and
    /// reported, never resent.
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(timeout);
        }

        if let Some(worker) = self.worker.take() {
            let abort = worker.abort_handle();
            if tokio::time::timeout(timeout, worker).await.is_err() {
                // Deadline passed with an export still in flight
                abort.abort();
                warn!("pipeline worker did not stop within the shutdown deadline");
            }
        }

        let (enqueued, overflow_dropped) = {
            let buffer = self.shared.buffer.lock().unwrap();
            let m = buffer.metrics();
            (m.spans_enqueued, m.spans_dropped)
        };
        let exported = self.shared.export_metrics.spans_exported();
        let failed = self.shared.export_metrics.spans_failed();
        let unflushed = enqueued
            .saturating_sub(overflow_dropped)
            .saturating_sub(failed)
            .saturating_sub(exported);

        ShutdownReport {
            spans_exported: exported,
            spans_dropped: overflow_dropped + failed + unflushed,
            spans_unflushed: unflushed,
        }
    }
}

impl Drop for SpanPipeline {
    fn drop(&mut self) {
        // shutdown() consumed the handles; anything else is an abandon
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Takes the batch if one is due and exports it. The buffer lock is released
/// before any I/O.
async fn flush_if_due(shared: &Shared, exporter: &dyn SpanExporterBoxed) {
    let batch = {
        let mut buffer = shared.buffer.lock().unwrap();
        if buffer.should_flush() {
            buffer.take_batch()
        } else {
            None
        }
    };

    let Some(batch) = batch else { return };
    let span_count = batch.len() as u64;

    match exporter.export_boxed(batch).await {
        Ok(()) => {
            shared.export_metrics.record_success(span_count);
            debug!(spans = span_count, "span batch exported");
        }
        Err(e) => {
            shared.export_metrics.record_failure(span_count);
            error!(spans = span_count, error = %e, "span batch dropped after failed export");
        }
    }
}

/// Drains everything left in the buffer and attempts one bounded final
/// export. A flush that outlives `grace` is abandoned; accounting of the
/// abandoned spans happens in [`SpanPipeline::shutdown`].
async fn final_flush(shared: &Shared, exporter: &dyn SpanExporterBoxed, grace: Duration) {
    let batch = {
        let mut buffer = shared.buffer.lock().unwrap();
        buffer.take_batch()
    };

    let Some(batch) = batch else { return };
    let span_count = batch.len() as u64;

    match tokio::time::timeout(grace, exporter.export_boxed(batch)).await {
        Ok(Ok(())) => {
            shared.export_metrics.record_success(span_count);
            debug!(spans = span_count, "final span batch exported");
        }
        Ok(Err(e)) => {
            shared.export_metrics.record_failure(span_count);
            error!(spans = span_count, error = %e, "final span batch dropped");
        }
        Err(_) => {
            warn!(spans = span_count, "final flush exceeded shutdown deadline; spans discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ExportError, SpanExporter, TestExporter};
    use crate::span::{SpanBatch, SpanKind};

    fn make_span(seq: u64) -> Span {
        Span::new(1, seq, 0, "transport-message".to_string(), SpanKind::Consumer)
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            batch: BatchConfig {
                max_batch_size: 8,
                max_batch_interval: Duration::from_millis(100),
                max_buffer_capacity: 64,
            },
            flush_tick: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_flush() {
        let exporter = Arc::new(TestExporter::new());
        let pipeline = SpanPipeline::with_exporter(quick_config(), exporter.clone());
        let handle = pipeline.handle();

        for i in 0..20 {
            handle.enqueue(make_span(i));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = pipeline.shutdown(Duration::from_secs(1)).await;

        assert_eq!(report.spans_exported, 20);
        assert_eq!(report.spans_dropped, 0);
        assert_eq!(exporter.exported_count(), 20);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let exporter = Arc::new(TestExporter::new());
        let config = PipelineConfig {
            batch: BatchConfig {
                max_batch_size: 512,
                max_batch_interval: Duration::from_secs(3600),
                max_buffer_capacity: 2048,
            },
            flush_tick: Duration::from_secs(3600),
            ..Default::default()
        };
        let pipeline = SpanPipeline::with_exporter(config, exporter.clone());
        let handle = pipeline.handle();

        for i in 0..5 {
            handle.enqueue(make_span(i));
        }

        // Neither size nor interval triggered; shutdown drains
        let report = pipeline.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.spans_exported, 5);
        assert_eq!(report.spans_unflushed, 0);
        assert_eq!(exporter.exported_count(), 5);
    }

    /// Exporter that never completes, simulating a hung collector.
    struct HangingExporter;

    impl SpanExporter for HangingExporter {
        async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_shutdown_bounded_with_hung_collector() {
        let pipeline =
            SpanPipeline::with_exporter(quick_config(), Arc::new(HangingExporter));
        let handle = pipeline.handle();

        for i in 0..5 {
            handle.enqueue(make_span(i));
        }

        let started = std::time::Instant::now();
        let report = pipeline.shutdown(Duration::from_millis(250)).await;
        let elapsed = started.elapsed();

        assert!(
            elapsed < Duration::from_secs(2),
            "shutdown exceeded bound: {:?}",
            elapsed
        );
        assert_eq!(report.spans_exported, 0);
        assert_eq!(report.spans_dropped, 5);
        assert_eq!(report.spans_unflushed, 5);
    }

    #[tokio::test]
    async fn test_enqueue_never_blocks_on_stalled_exporter() {
        let config = PipelineConfig {
            batch: BatchConfig {
                max_batch_size: 4,
                max_batch_interval: Duration::from_millis(20),
                max_buffer_capacity: 16,
            },
            flush_tick: Duration::from_millis(10),
            ..Default::default()
        };
        let pipeline = SpanPipeline::with_exporter(config, Arc::new(HangingExporter));
        let handle = pipeline.handle();

        // Far more spans than the buffer holds, against a stalled exporter
        let started = std::time::Instant::now();
        for i in 0..10_000 {
            handle.enqueue(make_span(i));
        }
        let elapsed = started.elapsed();

        // Pure queue operations: generous bound to absorb CI jitter
        assert!(
            elapsed < Duration::from_secs(1),
            "enqueue stalled: {:?}",
            elapsed
        );
        assert!(handle.batch_metrics().spans_dropped > 0);

        let report = pipeline.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.spans_exported, 0);
    }

    #[tokio::test]
    async fn test_flush_on_size_without_interval() {
        let exporter = Arc::new(TestExporter::new());
        let config = PipelineConfig {
            batch: BatchConfig {
                max_batch_size: 10,
                max_batch_interval: Duration::from_secs(3600),
                max_buffer_capacity: 100,
            },
            flush_tick: Duration::from_secs(3600),
            ..Default::default()
        };
        let pipeline = SpanPipeline::with_exporter(config, exporter.clone());
        let handle = pipeline.handle();

        for i in 0..10 {
            handle.enqueue(make_span(i));
        }

        // Only the size nudge can have triggered this flush
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exporter.exported_count(), 10);

        pipeline.shutdown(Duration::from_secs(1)).await;
    }
}
