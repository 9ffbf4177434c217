//! Transport Connection Manager
//!
//! Owns the single MQTT broker connection: establishes it with a fixed
//! client identifier, registers per-subscription handlers, and survives
//! broker blips by reconnecting with exponential backoff and resubscribing
//! the full topic list in its original order.
//!
//! Inbound messages are dispatched to handlers **on the event-loop task**;
//! handlers must be cheap and must never block on network I/O, or message
//! delivery stalls.

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use span_pipeline::span::unix_nanos_now;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One inbound message, alive only for the duration of a handler call.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message was published on (concrete, no wildcards)
    pub topic: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Arrival timestamp (Unix nanoseconds)
    pub received_at: u64,
}

/// Per-subscription message handler, bound at subscribe time.
pub trait MessageHandler: Send + Sync {
    /// Called once per inbound message on the event-loop task. Must not
    /// block.
    fn on_message(&self, msg: InboundMessage);
}

/// Errors establishing the broker connection. Fatal at start-up.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The broker address could not be parsed
    #[error("invalid broker address {addr:?}: {reason}")]
    InvalidBroker { addr: String, reason: String },
    /// The broker was unreachable or rejected the handshake
    #[error("broker connection failed: {0}")]
    Broker(String),
    /// No CONNACK arrived within the connect timeout
    #[error("timed out waiting for broker handshake")]
    HandshakeTimeout,
}

/// A single rejected or failed topic subscription.
#[derive(Debug, Clone)]
pub struct SubscribeFailure {
    pub filter: String,
    pub reason: String,
}

/// Errors subscribing topics. Every filter is attempted; this error carries
/// each individual failure rather than aborting at the first one.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("{} topic subscription(s) failed: {}", .failures.len(), format_failures(.failures))]
    Rejected { failures: Vec<SubscribeFailure> },
}

fn format_failures(failures: &[SubscribeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{:?} ({})", f.filter, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Connection lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    ShuttingDown = 3,
}

/// Atomic cell for sharing [`ConnectionState`] between the event-loop task
/// and observers.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::ShuttingDown,
        }
    }
}

/// Exponential reconnect backoff: doubles per failed attempt up to a cap,
/// reset after a successful handshake.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Returns the delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16); // beyond this the cap always wins
        let delay = self
            .initial
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Counters maintained by the event-loop task.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// Messages delivered to handlers
    messages_received: AtomicU64,
    /// Successful reconnects after an unexpected disconnect
    reconnects: AtomicU64,
}

impl TransportMetrics {
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Transport tuning; built from the service configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Broker address (`host:port`, optional `mqtt://`/`tcp://` prefix)
    pub broker: String,
    /// Fixed client identifier
    pub client_id: String,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Bound on the initial connect handshake
    pub connect_timeout: Duration,
    /// Bound on waiting for a subscription ack
    pub subscribe_timeout: Duration,
    /// First reconnect delay
    pub reconnect_initial_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
}

impl TransportConfig {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }

    /// Sets the initial-connect bound.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the reconnect backoff range.
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max;
        self
    }
}

struct Subscription {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

/// A SUBSCRIBE request awaiting its SUBACK, in request order. Start-up
/// subscriptions carry an ack channel; resubscriptions after a reconnect
/// only log.
struct PendingAck {
    filter: String,
    ack_tx: Option<oneshot::Sender<Result<(), String>>>,
}

struct EventCtx {
    state: Arc<StateCell>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    pending_acks: Arc<Mutex<VecDeque<PendingAck>>>,
    metrics: Arc<TransportMetrics>,
    client: AsyncClient,
}

/// Owns the broker connection and its event-loop task.
pub struct TransportManager {
    client: AsyncClient,
    config: TransportConfig,
    state: Arc<StateCell>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    pending_acks: Arc<Mutex<VecDeque<PendingAck>>>,
    metrics: Arc<TransportMetrics>,
    event_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Opens the broker connection and waits for the handshake.
    ///
    /// Fails fast: before the first successful CONNACK any transport error is
    /// returned to the caller instead of entering the reconnect loop:
    /// a broker that was never reachable is a start-up failure, not a blip.
    pub async fn connect(config: &TransportConfig) -> Result<Self, ConnectError> {
        let (host, port) = parse_broker(&config.broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(options, 64);

        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let pending_acks = Arc::new(Mutex::new(VecDeque::new()));
        let metrics = Arc::new(TransportMetrics::default());

        let (connected_tx, connected_rx) = oneshot::channel();

        let ctx = EventCtx {
            state: Arc::clone(&state),
            subscriptions: Arc::clone(&subscriptions),
            pending_acks: Arc::clone(&pending_acks),
            metrics: Arc::clone(&metrics),
            client: client.clone(),
        };
        let backoff = ReconnectBackoff::new(
            config.reconnect_initial_delay,
            config.reconnect_max_delay,
        );
        let event_task = tokio::spawn(run_event_loop(event_loop, ctx, backoff, connected_tx));

        let handshake = tokio::time::timeout(config.connect_timeout, connected_rx).await;
        match handshake {
            Ok(Ok(Ok(()))) => {
                info!(broker = %config.broker, client_id = %config.client_id, "connected to broker");
                Ok(Self {
                    client,
                    config: config.clone(),
                    state,
                    subscriptions,
                    pending_acks,
                    metrics,
                    event_task: Some(event_task),
                })
            }
            Ok(Ok(Err(reason))) => {
                event_task.abort();
                Err(ConnectError::Broker(reason))
            }
            Ok(Err(_)) => {
                event_task.abort();
                Err(ConnectError::Broker("event loop stopped".into()))
            }
            Err(_) => {
                event_task.abort();
                Err(ConnectError::HandshakeTimeout)
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Transport counters
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Topic filters currently registered, in subscription order.
    pub fn subscribed_filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    /// Subscribes the given filters at QoS 0, binding `handler` to each.
    ///
    /// Every filter is attempted even when an earlier one fails; the error
    /// reports each rejected filter individually. Accepted filters are
    /// retained for automatic resubscription after a reconnect.
    pub async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SubscribeError> {
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        for filter in topics {
            if filter.trim().is_empty() {
                failures.push(SubscribeFailure {
                    filter: filter.clone(),
                    reason: "empty topic filter".into(),
                });
                continue;
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            self.pending_acks.lock().unwrap().push_back(PendingAck {
                filter: filter.clone(),
                ack_tx: Some(ack_tx),
            });

            if let Err(e) = self.client.subscribe(filter.clone(), QoS::AtMostOnce).await {
                // Request never reached the event loop; retire the entry
                self.pending_acks.lock().unwrap().pop_back();
                failures.push(SubscribeFailure {
                    filter: filter.clone(),
                    reason: e.to_string(),
                });
                continue;
            }

            self.subscriptions.lock().unwrap().push(Subscription {
                filter: filter.clone(),
                handler: Arc::clone(&handler),
            });
            pending.push((filter.clone(), ack_rx));
        }

        for (filter, ack_rx) in pending {
            let outcome = match tokio::time::timeout(self.config.subscribe_timeout, ack_rx).await {
                Ok(Ok(Ok(()))) => {
                    info!(filter = %filter, "subscribed");
                    continue;
                }
                Ok(Ok(Err(reason))) => reason,
                Ok(Err(_)) => "event loop stopped before acknowledging".to_string(),
                Err(_) => "timed out waiting for broker acknowledgement".to_string(),
            };
            self.subscriptions
                .lock()
                .unwrap()
                .retain(|s| s.filter != filter);
            failures.push(SubscribeFailure {
                filter,
                reason: outcome,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SubscribeError::Rejected { failures })
        }
    }

    /// Tears down the connection: sends the clean DISCONNECT and waits up to
    /// `graceful_timeout` for the event loop to drain before releasing it
    /// unconditionally.
    pub async fn disconnect(mut self, graceful_timeout: Duration) {
        self.state.set(ConnectionState::ShuttingDown);
        let _ = self.client.disconnect().await;

        if let Some(task) = self.event_task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(graceful_timeout, task).await.is_err() {
                abort.abort();
                warn!("event loop did not stop within the disconnect deadline");
            }
        }
        self.state.set(ConnectionState::Disconnected);
        info!("disconnected from broker");
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        // disconnect() consumed the handle on the orderly path
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    ctx: EventCtx,
    mut backoff: ReconnectBackoff,
    connected_tx: oneshot::Sender<Result<(), String>>,
) {
    // Consumed on the first handshake outcome; its presence marks the
    // fail-fast initial-connect phase.
    let mut connected_tx = Some(connected_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker rejected handshake: {:?}", ack.code);
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(Err(reason));
                        return;
                    }
                    warn!(code = ?ack.code, "broker rejected reconnect handshake");
                    continue;
                }

                backoff.reset();
                let reconnect = connected_tx.is_none();
                ctx.state.set(ConnectionState::Connected);
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(Ok(()));
                } else {
                    ctx.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                if reconnect {
                    resubscribe_all(&ctx);
                }
            }

            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    received_at: unix_nanos_now(),
                };
                dispatch(&ctx, msg);
            }

            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                handle_suback(&ctx, &ack);
            }

            Ok(Event::Incoming(Packet::Disconnect)) => {
                // Broker-initiated disconnect; the next poll surfaces the
                // connection error and drives the reconnect path.
                debug!("broker sent disconnect");
            }

            Ok(_) => {}

            Err(e) => {
                if ctx.state.get() == ConnectionState::ShuttingDown {
                    debug!("event loop closing after disconnect");
                    return;
                }

                if let Some(tx) = connected_tx.take() {
                    // Never connected: report and stop instead of retrying
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }

                ctx.state.set(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "broker connection lost; reconnecting");
                ctx.state.set(ConnectionState::Connecting);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Replays every registered subscription, in original subscribe order, after
/// a reconnect re-established the session.
fn resubscribe_all(ctx: &EventCtx) {
    let filters: Vec<String> = ctx
        .subscriptions
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.filter.clone())
        .collect();

    if filters.is_empty() {
        return;
    }
    info!(count = filters.len(), "resubscribing topics after reconnect");

    for filter in filters {
        ctx.pending_acks.lock().unwrap().push_back(PendingAck {
            filter: filter.clone(),
            ack_tx: None,
        });
        // try_subscribe: the event loop cannot await its own request channel
        if let Err(e) = ctx.client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
            ctx.pending_acks.lock().unwrap().pop_back();
            error!(filter = %filter, error = %e, "failed to queue resubscription");
        }
    }
}

fn handle_suback(ctx: &EventCtx, ack: &SubAck) {
    let entry = ctx.pending_acks.lock().unwrap().pop_front();
    let Some(entry) = entry else {
        warn!(pkid = ack.pkid, "unmatched subscription acknowledgement");
        return;
    };

    // One filter per SUBSCRIBE request, so exactly one reason code
    let result = match ack.return_codes.first() {
        Some(SubscribeReasonCode::Success(_)) => Ok(()),
        Some(SubscribeReasonCode::Failure) => Err("broker rejected the filter".to_string()),
        None => Err("empty subscription acknowledgement".to_string()),
    };

    match entry.ack_tx {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            // Resubscription after reconnect: steady state, log only
            match result {
                Ok(()) => debug!(filter = %entry.filter, "resubscribed"),
                Err(reason) => {
                    error!(filter = %entry.filter, reason = %reason, "resubscription rejected");
                }
            }
        }
    }
}

/// Delivers a message to every subscription whose filter matches its topic.
fn dispatch(ctx: &EventCtx, msg: InboundMessage) {
    let subscriptions = ctx.subscriptions.lock().unwrap();
    let mut delivered = false;
    for sub in subscriptions.iter() {
        if topic_matches(&sub.filter, &msg.topic) {
            delivered = true;
            ctx.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
            sub.handler.on_message(msg.clone());
        }
    }
    if !delivered {
        debug!(topic = %msg.topic, "message on topic with no registered handler");
    }
}

/// Parses `host[:port]` with optional `mqtt://` / `tcp://` prefix.
fn parse_broker(addr: &str) -> Result<(String, u16), ConnectError> {
    let trimmed = addr
        .strip_prefix("mqtt://")
        .or_else(|| addr.strip_prefix("tcp://"))
        .unwrap_or(addr)
        .trim();

    if trimmed.is_empty() {
        return Err(ConnectError::InvalidBroker {
            addr: addr.to_string(),
            reason: "empty address".into(),
        });
    }

    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(ConnectError::InvalidBroker {
                    addr: addr.to_string(),
                    reason: "empty host".into(),
                });
            }
            let port: u16 = port.parse().map_err(|_| ConnectError::InvalidBroker {
                addr: addr.to_string(),
                reason: format!("invalid port {port:?}"),
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), 1883)),
    }
}

/// MQTT topic filter matching: `+` matches one level, `#` matches the rest
/// (and must be the final level).
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
