//! Content-based dispatcher for inbound table messages.
//!
//! Classification runs a deterministic, ordered rule set: the explicit
//! `type` discriminator wins when the server sent one, then marker fields in
//! the payload, then the application-level error check, then the
//! unclassified fallback. Handler failures are contained per handler; a bad
//! handler can never take the channel down or starve other topics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::channel::InboundEnvelope;

/// Topics produced by the classifier
pub mod topics {
    /// Table countdown tick before bets close
    pub const COUNTDOWN: &str = "countdown";
    /// Outcome of a finished deal
    pub const DEAL_RESULT: &str = "deal_result";
    /// Player balance changed
    pub const BALANCE_UPDATE: &str = "balance_update";
    /// Seats / table composition changed
    pub const TABLE_STATE: &str = "table_state";
    /// Application-level error pushed by the server
    pub const GAME_ERROR: &str = "game_error";
    /// Nothing matched
    pub const UNCLASSIFIED: &str = "unclassified";
}

/// Handler invoked for every envelope routed to its topic
pub type Handler = Arc<dyn Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub dispatched: AtomicU64,
    pub unhandled: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub dispatched: u64,
    pub unhandled: u64,
    pub handler_errors: u64,
}

/// Routes inbound envelopes to at most one handler per topic
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
    stats: DispatchStats,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Register a handler. Re-registering replaces the previous one.
    pub fn register_handler<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(topic.to_string(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, topic: &str) {
        self.handlers.write().remove(topic);
    }

    pub fn clear_all(&self) {
        self.handlers.write().clear();
    }

    /// Classify and route one envelope. Never fails.
    pub fn dispatch(&self, envelope: &InboundEnvelope) {
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let topic = classify(envelope);

        let handler = self.handlers.read().get(topic.as_str()).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler(envelope) {
                    self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("handler for '{}' failed: {:#}", topic, e);
                }
            }
            None => {
                self.stats.unhandled.fetch_add(1, Ordering::Relaxed);
                debug!("no handler registered for '{}'", topic);
            }
        }
    }

    /// Drain the channel's inbound stream until it closes or shutdown fires.
    /// Envelopes are dispatched strictly in arrival order.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.dispatch(&envelope),
                    None => break,
                },
            }
        }
        debug!("dispatch loop stopped");
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered classification rules. The payload shape markers mirror the
/// server's known message families; overlapping shapes resolve to the first
/// rule that matches.
pub fn classify(envelope: &InboundEnvelope) -> String {
    // 1. Explicit discriminator wins
    if let Some(topic) = envelope.topic.as_deref() {
        if !topic.is_empty() {
            return topic.to_string();
        }
    }

    let payload = &envelope.payload;
    let has = |field: &str| payload.get(field).is_some();

    // 2. Marker fields, most specific first
    if has("countdown_ms") || has("countdown") {
        return topics::COUNTDOWN.to_string();
    }
    if has("winning_hand") || has("cards") || has("result") {
        return topics::DEAL_RESULT.to_string();
    }
    if has("balance") || has("balance_delta") {
        return topics::BALANCE_UPDATE.to_string();
    }
    if has("seats") {
        return topics::TABLE_STATE.to_string();
    }

    // 3. Application-level error code
    if has("error_code") {
        return topics::GAME_ERROR.to_string();
    }

    // 4. Fallback
    topics::UNCLASSIFIED.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    fn envelope(topic: Option<&str>, payload: Value) -> InboundEnvelope {
        InboundEnvelope {
            topic: topic.map(str::to_string),
            payload,
            received_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_explicit_discriminator_wins() {
        // A payload that would sniff as a deal result still routes by `type`
        let env = envelope(Some("balance_update"), json!({"cards": ["AS"]}));
        assert_eq!(classify(&env), topics::BALANCE_UPDATE);
    }

    #[tokio::test]
    async fn test_marker_field_classification() {
        assert_eq!(
            classify(&envelope(None, json!({"countdown_ms": 5000}))),
            topics::COUNTDOWN
        );
        assert_eq!(
            classify(&envelope(None, json!({"winning_hand": "banker"}))),
            topics::DEAL_RESULT
        );
        assert_eq!(
            classify(&envelope(None, json!({"balance": 1250.5}))),
            topics::BALANCE_UPDATE
        );
        assert_eq!(
            classify(&envelope(None, json!({"seats": [1, 2, 3]}))),
            topics::TABLE_STATE
        );
        assert_eq!(
            classify(&envelope(None, json!({"error_code": 42}))),
            topics::GAME_ERROR
        );
        assert_eq!(
            classify(&envelope(None, json!({"something": "else"}))),
            topics::UNCLASSIFIED
        );
    }

    #[tokio::test]
    async fn test_rule_order_is_deterministic() {
        // Overlapping markers: countdown outranks deal result
        let env = envelope(None, json!({"countdown_ms": 1000, "cards": []}));
        assert_eq!(classify(&env), topics::COUNTDOWN);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = MessageDispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = second.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&envelope(None, json!({"countdown_ms": 100})));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let dispatcher = MessageDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.register_handler(topics::DEAL_RESULT, |_| {
            Err(anyhow::anyhow!("corrupt result payload"))
        });
        let c = delivered.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Failing handler, then a healthy dispatch right after
        dispatcher.dispatch(&envelope(None, json!({"cards": ["AS", "KD"]})));
        dispatcher.dispatch(&envelope(None, json!({"countdown_ms": 100})));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let snap = dispatcher.stats().snapshot();
        assert_eq!(snap.dispatched, 2);
        assert_eq!(snap.handler_errors, 1);
    }

    #[tokio::test]
    async fn test_unhandled_topic_does_not_disturb_later_dispatches() {
        let dispatcher = MessageDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let c = delivered.clone();
        dispatcher.register_handler(topics::BALANCE_UPDATE, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&envelope(None, json!({"unknown": true})));
        dispatcher.dispatch(&envelope(None, json!({"balance": 10.0})));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().snapshot().unhandled, 1);
    }

    #[tokio::test]
    async fn test_unregister_and_clear() {
        let dispatcher = MessageDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let c = delivered.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.unregister_handler(topics::COUNTDOWN);
        dispatcher.dispatch(&envelope(None, json!({"countdown_ms": 1})));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        let c = delivered.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.clear_all();
        dispatcher.dispatch(&envelope(None, json!({"countdown_ms": 1})));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_in_arrival_order() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let seen: Arc<parking_lot::Mutex<Vec<i64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let c = seen.clone();
        dispatcher.register_handler(topics::COUNTDOWN, move |env| {
            c.lock()
                .push(env.payload["countdown_ms"].as_i64().unwrap_or(-1));
            Ok(())
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.clone().run(rx, shutdown_rx));

        for ms in [3000, 2000, 1000] {
            tx.send(envelope(None, json!({"countdown_ms": ms}))).unwrap();
        }
        drop(tx);
        task.await.unwrap();
        drop(shutdown_tx);

        assert_eq!(*seen.lock(), vec![3000, 2000, 1000]);
    }
}
