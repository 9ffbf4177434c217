//! Bounded Batch Buffer
//!
//! A pure batching abstraction with no concurrency overhead: an ordered
//! buffer of finished spans with a hard capacity and a size/interval flush
//! decision. Concurrency lives in `pipeline`; the buffer itself is plain
//! data guarded there by a mutex, so metrics are plain `u64` with no atomic
//! cost.
//!
//! When the buffer is full the **oldest** span is dropped and counted. The
//! producer hot path must never block on a slow exporter, and fresh spans
//! are worth more than stale ones.

use crate::span::{Span, SpanBatch};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch buffering
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Batch is flushed when it holds this many spans
    pub max_batch_size: usize,
    /// Batch is flushed when this much time has passed since the last flush
    pub max_batch_interval: Duration,
    /// Hard cap on buffered spans; beyond it the oldest span is dropped
    pub max_buffer_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_batch_interval: Duration::from_secs(5),
            max_buffer_capacity: 2048,
        }
    }
}

/// Metrics for the buffer (plain u64 - the buffer is externally synchronized)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Total spans accepted into the buffer
    pub spans_enqueued: u64,
    /// Total spans dropped because the buffer was at capacity
    pub spans_dropped: u64,
}

/// Ordered buffer of completed spans awaiting export.
///
/// Append is O(1) and never blocks; overflow evicts the oldest span.
pub struct BatchBuffer {
    queue: VecDeque<Span>,
    config: BatchConfig,
    metrics: BatchMetrics,
    last_flush: Instant,
}

impl BatchBuffer {
    /// Creates an empty buffer
    pub fn new(config: BatchConfig) -> Self {
        let capacity = config.max_buffer_capacity;
        Self {
            queue: VecDeque::with_capacity(capacity.min(4096)),
            config,
            metrics: BatchMetrics::default(),
            last_flush: Instant::now(),
        }
    }

    /// Appends a finished span.
    ///
    /// Returns `true` if the buffer has reached `max_batch_size` and a flush
    /// should be scheduled. Never blocks; at capacity the oldest span is
    /// evicted and counted in [`BatchMetrics::spans_dropped`].
    pub fn push(&mut self, span: Span) -> bool {
        if self.queue.len() >= self.config.max_buffer_capacity {
            self.queue.pop_front();
            self.metrics.spans_dropped += 1;
        }
        self.queue.push_back(span);
        self.metrics.spans_enqueued += 1;

        self.queue.len() >= self.config.max_batch_size
    }

    /// Returns the number of buffered spans
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no spans are buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Checks whether a flush is due: size threshold reached, or the flush
    /// interval elapsed with at least one span buffered.
    pub fn should_flush(&self) -> bool {
        !self.queue.is_empty()
            && (self.queue.len() >= self.config.max_batch_size
                || self.last_flush.elapsed() >= self.config.max_batch_interval)
    }

    /// Takes all buffered spans as a batch and resets the flush clock.
    ///
    /// Returns `None` if the buffer is empty. The caller owns the export and
    /// its accounting.
    pub fn take_batch(&mut self) -> Option<SpanBatch> {
        if self.queue.is_empty() {
            return None;
        }
        let spans: Vec<Span> = self.queue.drain(..).collect();
        self.last_flush = Instant::now();
        Some(SpanBatch::with_spans(spans))
    }

    /// Returns buffer metrics
    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;

    fn make_span(seq: u64) -> Span {
        Span::new(1, seq, 0, "transport-message".to_string(), SpanKind::Consumer)
    }

    #[tokio::test]
    async fn test_flush_on_size() {
        let config = BatchConfig {
            max_batch_size: 5,
            max_batch_interval: Duration::from_secs(3600),
            max_buffer_capacity: 100,
        };
        let mut buffer = BatchBuffer::new(config);

        for i in 0..4 {
            assert!(!buffer.push(make_span(i)));
        }
        assert!(!buffer.should_flush()); // below size, interval far away

        assert!(buffer.push(make_span(4))); // size threshold hit
        assert!(buffer.should_flush());

        let batch = buffer.take_batch().unwrap();
        assert_eq!(batch.len(), 5);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval_with_single_span() {
        let config = BatchConfig {
            max_batch_size: 512,
            max_batch_interval: Duration::from_secs(5),
            max_buffer_capacity: 2048,
        };
        let mut buffer = BatchBuffer::new(config);

        buffer.push(make_span(0));
        assert!(!buffer.should_flush());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(buffer.should_flush());
        assert_eq!(buffer.take_batch().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_at_capacity() {
        let config = BatchConfig {
            max_batch_size: 1000,
            max_batch_interval: Duration::from_secs(3600),
            max_buffer_capacity: 3,
        };
        let mut buffer = BatchBuffer::new(config);

        for i in 0..5 {
            buffer.push(make_span(i));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.metrics().spans_dropped, 2);
        assert_eq!(buffer.metrics().spans_enqueued, 5);

        // Oldest spans (0, 1) were evicted; 2, 3, 4 remain in order
        let batch = buffer.take_batch().unwrap();
        let ids: Vec<u64> = batch.spans.iter().map(|s| s.span_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_take_batch_empty() {
        let mut buffer = BatchBuffer::new(BatchConfig::default());
        assert!(buffer.take_batch().is_none());
    }
}
