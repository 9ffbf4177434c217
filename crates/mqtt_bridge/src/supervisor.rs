//! Bridge Supervisor
//!
//! Sequences start-up (exporter pipeline first, then the broker connection,
//! then subscriptions), parks on a cancellation signal, and tears the two
//! ends down in reverse order. Exporter initialization gates the broker
//! connection: a bridge that cannot ship spans has no business consuming
//! messages.
//!
//! Any failure before steady state is fatal and identifies the failing step;
//! nothing after steady state is allowed to end the process besides the
//! termination signal.

use crate::bridge::SpanBridge;
use crate::config::{BridgeConfig, ConfigError};
use crate::transport::{
    ConnectError, MessageHandler, SubscribeError, TransportConfig, TransportManager,
};
use span_pipeline::{
    BatchConfig, InitError, PipelineConfig, ShutdownReport, SpanPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

/// Start-up failures, one variant per sequencing step.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("exporter initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("broker connection failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("topic subscription failed: {0}")]
    Subscribe(#[from] SubscribeError),
}

impl SupervisorError {
    /// Process exit code distinguishing the failing step.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Init(_) => 3,
            Self::Connect(_) => 4,
            Self::Subscribe(_) => 5,
        }
    }
}

/// A cloneable cancellation signal for ending the run loop.
///
/// Triggering is idempotent (only the first call has effect) and waiters
/// registered before or after the trigger all observe it.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Triggers shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes when shutdown is triggered (immediately if it already was).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // Err only if the sender dropped, which we hold
        let _ = rx.changed().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires OS termination signals (SIGINT/SIGTERM) to the shutdown signal.
pub fn listen_for_termination(signal: ShutdownSignal) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received");
        signal.shutdown();
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler; handling SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

fn pipeline_config(config: &BridgeConfig) -> PipelineConfig {
    PipelineConfig {
        batch: BatchConfig {
            max_batch_size: config.tuning.max_batch_size,
            max_batch_interval: config.tuning.max_batch_interval(),
            max_buffer_capacity: config.tuning.max_buffer_capacity,
        },
        ..Default::default()
    }
}

/// Runs the bridge until `signal` fires, then tears down in reverse order.
///
/// Start-up order is pipeline → connect → subscribe; a failure at any step
/// unwinds what was already started before surfacing the error.
pub async fn run(
    config: &BridgeConfig,
    signal: &ShutdownSignal,
) -> Result<ShutdownReport, SupervisorError> {
    // 1. Exporter pipeline; its failure must precede any broker contact
    let pipeline = SpanPipeline::init(
        &config.otlp.endpoint,
        &config.otlp.service_name,
        pipeline_config(config),
    )?;

    // 2. Broker connection
    let transport_config =
        TransportConfig::new(config.mqtt.broker.clone(), config.mqtt.client_id.clone());
    let transport = match TransportManager::connect(&transport_config).await {
        Ok(transport) => transport,
        Err(e) => {
            let _ = pipeline.shutdown(Duration::from_millis(100)).await;
            return Err(e.into());
        }
    };

    // 3. Subscriptions, with the bridge bound as the handler
    let bridge = Arc::new(SpanBridge::new(
        pipeline.handle(),
        config.tuning.max_payload_attr_bytes,
    ));
    let handler: Arc<dyn MessageHandler> = Arc::clone(&bridge) as Arc<dyn MessageHandler>;
    if let Err(e) = transport.subscribe(&config.mqtt.topics, handler).await {
        let SubscribeError::Rejected { failures } = &e;
        for failure in failures {
            error!(filter = %failure.filter, reason = %failure.reason, "topic subscription failed");
        }
        transport.disconnect(config.tuning.disconnect_timeout()).await;
        let _ = pipeline.shutdown(config.tuning.shutdown_timeout()).await;
        return Err(e.into());
    }

    info!(
        broker = %config.mqtt.broker,
        topics = config.mqtt.topics.len(),
        collector = %config.otlp.endpoint,
        "bridge running"
    );

    // 4. Steady state until cancelled
    signal.wait().await;
    info!("shutting down");

    // 5. Reverse teardown: stop intake, then flush the pipeline
    transport.disconnect(config.tuning.disconnect_timeout()).await;
    let report = pipeline.shutdown(config.tuning.shutdown_timeout()).await;

    info!(
        messages = bridge.metrics().messages_handled(),
        spans_exported = report.spans_exported,
        spans_dropped = report.spans_dropped,
        "bridge stopped"
    );

    Ok(report)
}
