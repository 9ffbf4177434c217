//! MQTT → OTLP Span Bridge
//!
//! Subscribes to a set of MQTT topics and emits one root tracing span per
//! inbound message, annotated with message metadata, batching the spans out
//! to an OTLP collector through [`span_pipeline`]. The bridge observes
//! traffic; it never interprets payloads and never persists messages.
//!
//! Component layering, leaf first: [`transport`] owns the broker connection
//! (connect, subscribe, reconnect/resubscribe), [`bridge`] is the per-message
//! span-producing handler, and [`supervisor`] sequences start-up, keeps the
//! process alive until a termination signal, and tears both ends down in
//! reverse order.

pub mod bridge;
pub mod config;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use bridge::{BridgeMetrics, SpanBridge, MESSAGE_SPAN_NAME};
pub use config::{BridgeConfig, ConfigError, MqttSection, OtlpSection, TuningSection};
pub use supervisor::{run, ShutdownSignal, SupervisorError};
pub use transport::{
    ConnectError, ConnectionState, InboundMessage, MessageHandler, ReconnectBackoff,
    SubscribeError, SubscribeFailure, TransportConfig, TransportManager,
};
