//! Retrying Exporter Wrapper
//!
//! Decorates any [`SpanExporter`] with bounded retries and exponential
//! backoff. Once the budget is exhausted the batch is surrendered to the
//! caller as [`ExportError::RetriesExhausted`]; the pipeline drops it and
//! moves on; failed telemetry is never allowed to back up into the message
//! path.

use crate::exporter::{ExportError, SpanExporter};
use crate::span::SpanBatch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// An exporter wrapper that retries failed exports with exponential backoff.
pub struct RetryingExporter<E: SpanExporter> {
    inner: E,
    config: RetryConfig,
    /// Metrics: total retry attempts made
    total_retries: AtomicU64,
    /// Metrics: exports that succeeded after at least one retry
    recovered_exports: AtomicU64,
}

impl<E: SpanExporter> RetryingExporter<E> {
    /// Create a new retrying exporter with the given configuration.
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    /// Create with default retry configuration.
    pub fn with_defaults(inner: E) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns exports that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }
}

impl<E: SpanExporter> SpanExporter for RetryingExporter<E> {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let max_attempts = self.config.max_retries + 1; // +1 for initial attempt

        for attempt in 0..max_attempts {
            // Wait before retry (no delay on first attempt)
            let delay = self.config.delay_for_attempt(attempt);
            if !delay.is_zero() {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                sleep(delay).await;
            }

            match self.inner.export(batch.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        exporter = self.inner.name(),
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "span export attempt failed"
                    );
                }
            }
        }

        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Span, SpanKind};
    use std::sync::atomic::AtomicU32;

    /// An exporter that fails a configurable number of times before succeeding.
    struct FailingExporter {
        failures_remaining: AtomicU32,
        export_count: AtomicU32,
    }

    impl FailingExporter {
        fn new(fail_count: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(fail_count),
                export_count: AtomicU32::new(0),
            }
        }

        fn export_count(&self) -> u32 {
            self.export_count.load(Ordering::Relaxed)
        }
    }

    impl SpanExporter for FailingExporter {
        async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
            self.export_count.fetch_add(1, Ordering::Relaxed);

            let remaining = self.failures_remaining.fetch_sub(1, Ordering::Relaxed);
            if remaining > 0 {
                Err(ExportError::Transport("simulated failure".into()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn make_test_batch() -> SpanBatch {
        let mut batch = SpanBatch::new();
        batch.add(Span::new(1, 1, 0, "transport-message".into(), SpanKind::Consumer));
        batch
    }

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let retrying = RetryingExporter::new(FailingExporter::new(2), quick_retry(3));

        let result = retrying.export(make_test_batch()).await;
        assert!(result.is_ok());
        assert_eq!(retrying.total_retries(), 2);
        assert_eq!(retrying.recovered_exports(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let retrying = RetryingExporter::new(FailingExporter::new(10), quick_retry(2));

        let result = retrying.export(make_test_batch()).await;
        assert!(matches!(
            result,
            Err(ExportError::RetriesExhausted { attempts: 3 })
        ));
        assert_eq!(retrying.inner.export_count(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        // 100ms * 2^9 would be 51.2s; capped at 1s
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
    }
}
