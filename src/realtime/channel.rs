//! Reconnecting realtime channel for the live table feed.
//!
//! Owns the connection state machine, the heartbeat, and the outbound queue.
//! State transitions are the only mutation path: nothing outside this module
//! sets the state, observers get a `watch` receiver and events.
//!
//! Design principles:
//! - Fast failover with jittered backoff (no thundering herd on mass drops)
//! - Messages sent while offline queue FIFO and flush on reconnect
//! - Liveness problems are reported, never silently "fixed" by a disconnect

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::events::{EventBus, NetworkEvent};

use super::session::{BackoffCalculator, HeartbeatAction, HeartbeatMonitor};
use super::transport::{Transport, TransportConnection, TransportEvent};

/// Heartbeat tokens exchanged as plain text frames
pub const PING_TOKEN: &str = "ping";
pub const PONG_TOKEN: &str = "pong";

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Connect failed or the reconnect budget is exhausted
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Channel failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelErrorKind {
    ConnectFailed,
    SendFailed,
}

#[derive(Debug, Clone)]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub reason: String,
    pub recoverable: bool,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for ChannelError {}

// =============================================================================
// ENVELOPES
// =============================================================================

/// Envelope queued for delivery while the channel is offline
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub enqueued_at: Instant,
}

/// One inbound message. Produced by the channel, consumed once by the
/// dispatcher, not retained.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Explicit `type` discriminator when the server sent one
    pub topic: Option<String>,
    pub payload: Value,
    pub received_at: Instant,
}

fn encode_outbound(msg: &OutboundMessage) -> String {
    serde_json::json!({
        "id": msg.id,
        "type": msg.topic,
        "payload": msg.payload,
    })
    .to_string()
}

// =============================================================================
// STATISTICS
// =============================================================================

#[derive(Debug, Default)]
pub struct ChannelStats {
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub queued: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub flushed: AtomicU64,
}

impl ChannelStats {
    fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub queued: u64,
    pub queue_dropped: u64,
    pub flushed: u64,
}

// =============================================================================
// CHANNEL
// =============================================================================

/// The realtime channel
pub struct RealtimeChannel {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    events: EventBus,

    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,

    /// Writer into the live session; `None` while not connected
    writer: RwLock<Option<mpsc::UnboundedSender<String>>>,
    /// FIFO queue used while not connected
    queue: Mutex<VecDeque<OutboundMessage>>,

    inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEnvelope>>>,

    backoff: Mutex<BackoffCalculator>,
    reconnect_attempts: AtomicU32,
    latency_ewma_us: AtomicU64,
    stats: ChannelStats,

    /// Bumped to cancel the current session task
    session_gen: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>, events: EventBus) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (session_gen, _) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let backoff = BackoffCalculator::new(config.backoff.clone());

        Arc::new(Self {
            config,
            transport,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            writer: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            backoff: Mutex::new(backoff),
            reconnect_attempts: AtomicU32::new(0),
            latency_ewma_us: AtomicU64::new(0),
            stats: ChannelStats::default(),
            session_gen,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Observe state transitions without being able to cause them
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Take the inbound envelope stream (once)
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEnvelope>> {
        self.inbound_rx.lock().take()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Rolling heartbeat round-trip estimate
    pub fn latency_estimate(&self) -> Duration {
        Duration::from_micros(self.latency_ewma_us.load(Ordering::Relaxed))
    }

    fn set_state(&self, to: ConnectionState, reason: Option<String>) {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        let _ = self.state_tx.send(to);
        debug!("channel state {} -> {}", from, to);
        self.events.emit(NetworkEvent::StateChanged { from, to, reason });
    }

    /// Transition only when the current state matches `expected`
    fn transition_if(&self, expected: ConnectionState, to: ConnectionState, reason: Option<String>) -> bool {
        {
            let mut state = self.state.lock();
            if *state != expected {
                return false;
            }
            *state = to;
        }
        let _ = self.state_tx.send(to);
        debug!("channel state {} -> {}", expected, to);
        self.events.emit(NetworkEvent::StateChanged {
            from: expected,
            to,
            reason,
        });
        true
    }

    /// Open the connection. On success the reconnect counter resets, the
    /// queue flushes FIFO, and a session task takes over the socket.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            _ => {}
        }
        self.set_state(ConnectionState::Connecting, None);
        info!("🔌 connecting realtime channel");

        let conn = match timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.config.url),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => return Err(self.connect_failed("connect timed out".into())),
        };

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.backoff.lock().reset();
        self.stats.connects.fetch_add(1, Ordering::Relaxed);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.writer.write() = Some(out_tx.clone());
        self.set_state(ConnectionState::Connected, None);
        info!("✅ realtime channel connected");

        self.flush_queue(&out_tx);

        let gen_rx = self.session_gen.subscribe();
        tokio::spawn(self.clone().session_loop(conn, out_rx, gen_rx));
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> ChannelError {
        warn!("realtime connect failed: {}", reason);
        self.set_state(ConnectionState::Error, Some(reason.clone()));
        self.events.emit(NetworkEvent::ChannelError {
            kind: ChannelErrorKind::ConnectFailed,
            reason: reason.clone(),
            recoverable: true,
        });
        ChannelError {
            kind: ChannelErrorKind::ConnectFailed,
            reason,
            recoverable: true,
        }
    }

    /// Tear down the current session (if any), wait out the backoff, and
    /// try to connect again. Gives up for good once the attempt budget is
    /// spent; the caller sees that as a non-recoverable error.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ChannelError> {
        let max = self.config.max_reconnect_attempts;
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > max {
            self.reconnect_attempts.store(max, Ordering::SeqCst);
            warn!("reconnect budget exhausted after {} attempts", max);
            self.set_state(
                ConnectionState::Error,
                Some("reconnect attempts exhausted".into()),
            );
            self.events.emit(NetworkEvent::ReconnectExhausted { attempts: max });
            return Err(ChannelError {
                kind: ChannelErrorKind::ConnectFailed,
                reason: "reconnect attempts exhausted".into(),
                recoverable: false,
            });
        }

        self.set_state(ConnectionState::Reconnecting, None);
        self.teardown_session();

        let delay = self.backoff.lock().next_backoff();
        self.events.emit(NetworkEvent::ReconnectAttempt { attempt, max });
        info!("reconnect attempt {}/{} in {:?}", attempt, max, delay);
        sleep(delay).await;

        self.connect().await
    }

    /// Stop session and reconnect loops without leaking background work
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.writer.write() = None;
        self.set_state(ConnectionState::Disconnected, Some("shutdown".into()));
    }

    fn teardown_session(&self) {
        *self.writer.write() = None;
        self.session_gen.send_modify(|gen| *gen += 1);
    }

    /// Send an envelope. Connected: transmit immediately. Otherwise enqueue
    /// (queueing enabled) or fail with `SendFailed`.
    pub fn send(&self, topic: &str, payload: Value) -> Result<(), ChannelError> {
        let msg = OutboundMessage {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload,
            enqueued_at: Instant::now(),
        };

        if self.state() == ConnectionState::Connected {
            if let Some(out_tx) = self.writer.read().clone() {
                let text = encode_outbound(&msg);
                let len = text.len();
                if out_tx.send(text).is_ok() {
                    self.stats.record_sent(len);
                    return Ok(());
                }
            }
            // Session died under us; fall through to the offline path
        }

        if self.config.queue_outbound {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_size {
                // Oldest-drop: the newest table action wins over stale ones
                queue.pop_front();
                self.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("outbound queue full, dropping oldest message");
            }
            queue.push_back(msg);
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let err = ChannelError {
            kind: ChannelErrorKind::SendFailed,
            reason: "not connected and queueing disabled".into(),
            recoverable: true,
        };
        self.events.emit(NetworkEvent::ChannelError {
            kind: err.kind,
            reason: err.reason.clone(),
            recoverable: err.recoverable,
        });
        Err(err)
    }

    /// Drain the offline queue into the live session, FIFO
    fn flush_queue(&self, out_tx: &mpsc::UnboundedSender<String>) {
        let drained: Vec<OutboundMessage> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!("flushing {} queued messages", drained.len());
        for msg in drained {
            let text = encode_outbound(&msg);
            let len = text.len();
            if out_tx.send(text).is_err() {
                warn!("session closed mid-flush");
                break;
            }
            self.stats.record_sent(len);
            self.stats.flushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn session_loop(
        self: Arc<Self>,
        mut conn: Box<dyn TransportConnection>,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        mut gen_rx: watch::Receiver<u64>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = HeartbeatMonitor::new(
            self.config.heartbeat_interval,
            self.config.stale_multiplier,
        );
        let cadence = (self.config.heartbeat_interval / 4).max(Duration::from_millis(50));
        let mut check = interval(cadence);
        let mut superseded = false;

        let reason: String = loop {
            tokio::select! {
                // Control first, queued outbound before heartbeat
                biased;
                _ = shutdown_rx.changed() => {
                    conn.close().await;
                    superseded = true;
                    break "shutdown".into();
                }
                _ = gen_rx.changed() => {
                    conn.close().await;
                    superseded = true;
                    break "superseded".into();
                }
                maybe_out = out_rx.recv() => {
                    match maybe_out {
                        Some(text) => {
                            if let Err(e) = conn.send_text(text).await {
                                self.events.emit(NetworkEvent::ChannelError {
                                    kind: ChannelErrorKind::SendFailed,
                                    reason: e.to_string(),
                                    recoverable: true,
                                });
                                break format!("send failed: {}", e);
                            }
                        }
                        None => {
                            conn.close().await;
                            superseded = true;
                            break "writer dropped".into();
                        }
                    }
                }
                event = conn.recv() => {
                    match event {
                        Some(TransportEvent::Text(text)) => {
                            heartbeat.record_inbound();
                            if let Err(e) = self.handle_inbound(&text, &mut heartbeat, conn.as_mut()).await {
                                break format!("send failed: {}", e);
                            }
                        }
                        Some(TransportEvent::Closed { reason }) => break reason,
                        None => break "transport stream ended".into(),
                    }
                }
                _ = check.tick() => {
                    match heartbeat.check() {
                        HeartbeatAction::SendPing => {
                            if let Err(e) = conn.send_text(PING_TOKEN.into()).await {
                                self.events.emit(NetworkEvent::ChannelError {
                                    kind: ChannelErrorKind::SendFailed,
                                    reason: e.to_string(),
                                    recoverable: true,
                                });
                                break format!("ping failed: {}", e);
                            }
                            heartbeat.record_ping_sent();
                        }
                        HeartbeatAction::ReportStale(silence) => {
                            warn!("no inbound traffic for {:?}", silence);
                            self.events.emit(NetworkEvent::Liveness { silent_for: silence });
                        }
                        HeartbeatAction::Idle => {}
                    }
                }
            }
        };

        *self.writer.write() = None;
        self.stats.disconnects.fetch_add(1, Ordering::Relaxed);

        // A teardown initiated elsewhere already moved the state on
        if self.transition_if(
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            Some(reason.clone()),
        ) {
            info!("realtime channel disconnected: {}", reason);
            if !superseded && self.config.auto_reconnect && !*shutdown_rx.borrow() {
                self.spawn_auto_reconnect();
            }
        }
    }

    async fn handle_inbound(
        &self,
        text: &str,
        heartbeat: &mut HeartbeatMonitor,
        conn: &mut dyn TransportConnection,
    ) -> anyhow::Result<()> {
        if text == PING_TOKEN {
            conn.send_text(PONG_TOKEN.into()).await?;
            return Ok(());
        }
        if text == PONG_TOKEN {
            if let Some(rtt) = heartbeat.record_pong() {
                self.record_latency_sample(rtt);
            }
            return Ok(());
        }

        self.stats.record_received(text.len());
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                let topic = value.get("type").and_then(Value::as_str).map(str::to_string);
                self.events.emit(NetworkEvent::MessageReceived {
                    topic: topic.clone(),
                    bytes: text.len(),
                });
                let envelope = InboundEnvelope {
                    topic,
                    payload: value,
                    received_at: Instant::now(),
                };
                let _ = self.inbound_tx.send(envelope);
            }
            Err(e) => {
                warn!(
                    "failed to parse envelope: {} | {}",
                    e,
                    &text[..text.len().min(200)]
                );
            }
        }
        Ok(())
    }

    fn record_latency_sample(&self, rtt: Duration) {
        let sample = rtt.as_micros() as u64;
        let prev = self.latency_ewma_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            let alpha = self.config.latency_alpha;
            (alpha * sample as f64 + (1.0 - alpha) * prev as f64) as u64
        };
        self.latency_ewma_us.store(next, Ordering::Relaxed);
    }

    fn spawn_auto_reconnect(self: &Arc<Self>) {
        let channel = self.clone();
        tokio::spawn(async move {
            loop {
                if *channel.shutdown_tx.borrow() {
                    return;
                }
                match channel.reconnect().await {
                    Ok(()) => return,
                    Err(err) if !err.recoverable => return,
                    Err(_) => continue,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::realtime::transport::mock::MockTransport;
    use serde_json::json;

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            url: "wss://table.test.invalid/feed".into(),
            connect_timeout: Duration::from_secs(1),
            auto_reconnect: false,
            max_reconnect_attempts: 3,
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                max: Duration::from_millis(100),
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            heartbeat_interval: Duration::from_secs(5),
            stale_multiplier: 3,
            latency_alpha: 0.5,
            queue_outbound: true,
            max_queue_size: 8,
        }
    }

    fn payload_amount(text: &str) -> i64 {
        let v: Value = serde_json::from_str(text).unwrap();
        v["payload"]["amount"].as_i64().unwrap()
    }

    /// Next outbound frame that is not a heartbeat token
    async fn recv_envelope(handles: &mut crate::realtime::transport::mock::MockHandles) -> String {
        loop {
            let text = handles.outbound.recv().await.unwrap();
            if text != PING_TOKEN {
                return text;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_sends_queue_and_flush_in_order() {
        let transport = Arc::new(MockTransport::new());
        let mut handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        channel.send("place_bet", json!({"amount": 10})).unwrap();
        channel.send("place_bet", json!({"amount": 20})).unwrap();
        channel.send("place_bet", json!({"amount": 30})).unwrap();
        assert_eq!(channel.queue_len(), 3);

        channel.connect().await.unwrap();

        for expected in [10, 20, 30] {
            let text = recv_envelope(&mut handles).await;
            assert_eq!(payload_amount(&text), expected);
        }
        assert_eq!(channel.queue_len(), 0);
        assert_eq!(channel.stats().snapshot().flushed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_drops_oldest() {
        let transport = Arc::new(MockTransport::new());
        let mut handles = transport.push_success();
        let config = ChannelConfig {
            max_queue_size: 2,
            ..test_config()
        };
        let channel = RealtimeChannel::new(config, transport, EventBus::new(64));

        channel.send("place_bet", json!({"amount": 1})).unwrap();
        channel.send("place_bet", json!({"amount": 2})).unwrap();
        channel.send("place_bet", json!({"amount": 3})).unwrap();
        assert_eq!(channel.queue_len(), 2);
        assert_eq!(channel.stats().snapshot().queue_dropped, 1);

        channel.connect().await.unwrap();
        assert_eq!(payload_amount(&recv_envelope(&mut handles).await), 2);
        assert_eq!(payload_amount(&recv_envelope(&mut handles).await), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_connected_transmits_immediately() {
        let transport = Arc::new(MockTransport::new());
        let mut handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        channel.connect().await.unwrap();
        channel.send("place_bet", json!({"amount": 50})).unwrap();

        let text = recv_envelope(&mut handles).await;
        assert_eq!(payload_amount(&text), 50);

        let snap = channel.stats().snapshot();
        assert_eq!(snap.messages_sent, 1);
        assert!(snap.bytes_sent > 0);
        assert_eq!(channel.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reaches_error_state() {
        let transport = Arc::new(MockTransport::new());
        transport.push_failure("connection refused");
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        let err = channel.connect().await.unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::ConnectFailed);
        assert!(err.recoverable);
        assert_eq!(channel.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_halts_after_max_attempts() {
        let transport = Arc::new(MockTransport::new());
        transport.push_failure("down");
        transport.push_failure("down");
        transport.push_failure("down");
        let config = ChannelConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        };
        let channel = RealtimeChannel::new(config, transport.clone(), EventBus::new(64));

        assert!(channel.reconnect().await.unwrap_err().recoverable);
        assert!(channel.reconnect().await.unwrap_err().recoverable);
        let err = channel.reconnect().await.unwrap_err();
        assert!(!err.recoverable);

        assert_eq!(channel.reconnect_attempts(), 2);
        assert_eq!(channel.state(), ConnectionState::Error);
        // Only the two budgeted attempts hit the transport
        assert_eq!(transport.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_counter_resets_on_success() {
        let transport = Arc::new(MockTransport::new());
        transport.push_failure("down");
        let _handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        assert!(channel.reconnect().await.is_err());
        assert_eq!(channel.reconnect_attempts(), 1);

        channel.reconnect().await.unwrap();
        assert_eq!(channel.reconnect_attempts(), 0);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spontaneous_drop_disconnects_and_autoreconnects() {
        let transport = Arc::new(MockTransport::new());
        let handles1 = transport.push_success();
        let _handles2 = transport.push_success();
        let config = ChannelConfig {
            auto_reconnect: true,
            ..test_config()
        };
        let channel = RealtimeChannel::new(config, transport, EventBus::new(64));
        let mut events = channel.events.subscribe();

        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connected);

        handles1
            .inbound
            .send(TransportEvent::Closed {
                reason: "server restart".into(),
            })
            .unwrap();

        // Disconnect event carries the transport's reason...
        loop {
            if let NetworkEvent::StateChanged {
                to: ConnectionState::Disconnected,
                reason,
                ..
            } = events.recv().await.unwrap()
            {
                assert_eq!(reason.as_deref(), Some("server restart"));
                break;
            }
        }

        // ...then auto-reconnect brings the channel back
        loop {
            if let NetworkEvent::StateChanged {
                to: ConnectionState::Connected,
                ..
            } = events.recv().await.unwrap()
            {
                break;
            }
        }
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ping_pong_updates_latency() {
        let transport = Arc::new(MockTransport::new());
        let mut handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        channel.connect().await.unwrap();

        // First heartbeat check sends a ping straight away
        let ping = handles.outbound.recv().await.unwrap();
        assert_eq!(ping, PING_TOKEN);

        tokio::time::advance(Duration::from_millis(80)).await;
        handles
            .inbound
            .send(TransportEvent::Text(PONG_TOKEN.into()))
            .unwrap();

        // Give the session loop a moment to process the pong
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if channel.latency_estimate() > Duration::ZERO {
                break;
            }
        }
        assert_eq!(channel.latency_estimate(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_ping_token_answered_with_pong() {
        let transport = Arc::new(MockTransport::new());
        let mut handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));

        channel.connect().await.unwrap();
        // Skip the channel's own ping
        assert_eq!(handles.outbound.recv().await.unwrap(), PING_TOKEN);

        handles
            .inbound
            .send(TransportEvent::Text(PING_TOKEN.into()))
            .unwrap();
        assert_eq!(handles.outbound.recv().await.unwrap(), PONG_TOKEN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_envelope_reaches_consumer() {
        let transport = Arc::new(MockTransport::new());
        let handles = transport.push_success();
        let channel = RealtimeChannel::new(test_config(), transport, EventBus::new(64));
        let mut inbound = channel.take_inbound().unwrap();

        channel.connect().await.unwrap();
        handles
            .inbound
            .send(TransportEvent::Text(
                json!({"type": "deal_result", "cards": ["KH", "7S"]}).to_string(),
            ))
            .unwrap();

        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.topic.as_deref(), Some("deal_result"));
        assert_eq!(envelope.payload["cards"][0], "KH");
        assert_eq!(channel.stats().snapshot().messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_queueing_disabled_fails_offline() {
        let transport = Arc::new(MockTransport::new());
        let config = ChannelConfig {
            queue_outbound: false,
            ..test_config()
        };
        let channel = RealtimeChannel::new(config, transport, EventBus::new(64));

        let err = channel.send("place_bet", json!({"amount": 5})).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::SendFailed);
    }
}
