use crate::span::SpanBatch;
use std::future::Future;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (connection refused, DNS, TLS)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Collector accepted the connection but rejected the request
    #[error("collector returned status {status}")]
    Collector { status: u16 },
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
}

/// Trait for exporting span batches to a trace collector.
///
/// Uses native async fn in traits, no `#[async_trait]` macro.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Box<dyn SpanExporterBoxed>` via the blanket
/// implementation below.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Test exporter that records all exported spans for verification
#[cfg(test)]
pub struct TestExporter {
    spans: std::sync::Mutex<Vec<crate::span::Span>>,
}

#[cfg(test)]
impl Default for TestExporter {
    fn default() -> Self {
        Self {
            spans: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }
}

#[cfg(test)]
impl SpanExporter for TestExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.spans.lock().unwrap().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}
