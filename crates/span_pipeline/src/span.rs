use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Returns the current wall-clock time as unix nanoseconds.
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Represents a single distributed tracing span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span attributes (boxed to keep Span size manageable)
    pub attributes: Box<HashMap<String, AttributeValue>>,
    /// Timestamped events recorded during the span's lifetime
    pub events: Vec<SpanEvent>,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
}

/// Attribute value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A timestamped event attached to a span (e.g. an annotation failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name
    pub name: String,
    /// Event time (Unix nanoseconds)
    pub timestamp: u64,
    /// Event attributes
    pub attributes: HashMap<String, AttributeValue>,
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    Unset,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Batch of spans for export
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl Span {
    /// Creates a new span. Start time is set to now; the span stays open
    /// until [`Span::finish`] is called.
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: String,
        kind: SpanKind,
    ) -> Self {
        let now = unix_nanos_now();

        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now,
            end_time: now,
            name,
            attributes: Box::new(HashMap::new()),
            events: Vec::new(),
            status: SpanStatus::Unset,
            kind,
        }
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos_now();
        self.status = status;
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    /// Records a timestamped event on the span.
    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, AttributeValue>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: unix_nanos_now(),
            attributes,
        });
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}
