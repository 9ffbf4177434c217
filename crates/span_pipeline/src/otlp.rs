//! OTLP/HTTP Span Exporter
//!
//! Ships span batches to an OpenTelemetry collector over the OTLP/HTTP JSON
//! encoding (`POST {endpoint}/v1/traces`). Endpoint validation and HTTP
//! client construction happen once at build time; live connectivity failures
//! surface per export call as [`ExportError`] and are handled by the
//! pipeline's retry-then-drop policy.

use crate::exporter::{ExportError, SpanExporter};
use crate::span::{AttributeValue, Span, SpanBatch, SpanKind, SpanStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors constructing the exporter. These are start-up failures: a malformed
/// endpoint must be reported before any broker connection is attempted.
#[derive(Debug, Error)]
pub enum InitError {
    /// The collector endpoint is not a valid http(s) URL
    #[error("invalid collector endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    /// The HTTP client could not be constructed
    #[error("failed to build export client: {0}")]
    Client(String),
}

/// Exporter speaking OTLP/HTTP with JSON encoding.
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    traces_url: String,
    service_name: String,
}

impl OtlpHttpExporter {
    /// Creates an exporter for the given collector endpoint.
    ///
    /// This validates the endpoint and builds the HTTP client but performs no
    /// network I/O; an unreachable collector is a runtime export failure,
    /// not a construction failure.
    pub fn new(
        endpoint: &str,
        service_name: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, InitError> {
        let traces_url = format!("{}/v1/traces", endpoint.trim_end_matches('/'));

        let parsed =
            reqwest::Url::parse(&traces_url).map_err(|e| InitError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(InitError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InitError::Client(e.to_string()))?;

        Ok(Self {
            client,
            traces_url,
            service_name: service_name.into(),
        })
    }

    /// Encodes a batch as an OTLP `ExportTraceServiceRequest` in JSON form.
    fn encode_batch(&self, batch: &SpanBatch) -> Value {
        json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": { "stringValue": self.service_name }
                    }]
                },
                "scopeSpans": [{
                    "scope": {
                        "name": "span_pipeline",
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "spans": batch.spans.iter().map(encode_span).collect::<Vec<_>>()
                }]
            }]
        })
    }
}

fn encode_span(span: &Span) -> Value {
    json!({
        "traceId": format!("{:032x}", span.trace_id),
        "spanId": format!("{:016x}", span.span_id),
        "parentSpanId": if span.parent_span_id == 0 {
            String::new()
        } else {
            format!("{:016x}", span.parent_span_id)
        },
        "name": span.name,
        "kind": encode_kind(span.kind),
        "startTimeUnixNano": span.start_time.to_string(),
        "endTimeUnixNano": span.end_time.to_string(),
        "attributes": encode_attributes(&span.attributes),
        "events": span.events.iter().map(|e| {
            json!({
                "timeUnixNano": e.timestamp.to_string(),
                "name": e.name,
                "attributes": encode_attributes(&e.attributes),
            })
        }).collect::<Vec<_>>(),
        "status": { "code": encode_status(span.status) },
    })
}

fn encode_attributes(attributes: &HashMap<String, AttributeValue>) -> Vec<Value> {
    attributes
        .iter()
        .map(|(key, value)| {
            let encoded = match value {
                AttributeValue::String(s) => json!({ "stringValue": s }),
                // int64 is carried as a decimal string in OTLP JSON
                AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
                AttributeValue::Float(f) => json!({ "doubleValue": f }),
                AttributeValue::Bool(b) => json!({ "boolValue": b }),
            };
            json!({ "key": key, "value": encoded })
        })
        .collect()
}

fn encode_kind(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
        SpanKind::Producer => 4,
        SpanKind::Consumer => 5,
    }
}

fn encode_status(status: SpanStatus) -> u8 {
    match status {
        SpanStatus::Unset => 0,
        SpanStatus::Ok => 1,
        SpanStatus::Error => 2,
    }
}

impl SpanExporter for OtlpHttpExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let body = self.encode_batch(&batch);

        let response = self
            .client
            .post(&self.traces_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExportError::Timeout
                } else {
                    ExportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Collector {
                status: status.as_u16(),
            });
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "otlp-http"
    }
}
