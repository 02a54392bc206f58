//! Typed events exposed to the rest of the application.
//!
//! Every component publishes onto one broadcast bus; consumers subscribe and
//! filter. Events are values, never raw errors, so slow or absent consumers
//! can never stall the network core.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::monitor::alerts::{Alert, AlertId};
use crate::monitor::history::PerformanceSnapshot;
use crate::monitor::quality::QualityTier;
use crate::realtime::channel::{ChannelErrorKind, ConnectionState};

/// Events emitted by the network core
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Realtime channel state transition
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        reason: Option<String>,
    },
    /// An envelope arrived on the realtime channel
    MessageReceived { topic: Option<String>, bytes: usize },
    /// Channel-level failure; the caller decides whether to reconnect
    ChannelError {
        kind: ChannelErrorKind,
        reason: String,
        recoverable: bool,
    },
    /// A reconnect attempt is about to run
    ReconnectAttempt { attempt: u32, max: u32 },
    /// Auto-reconnect gave up after exhausting its attempt budget
    ReconnectExhausted { attempts: u32 },
    /// Heartbeat silence exceeded the configured staleness bound.
    /// Reported, not enforced: the channel stays up.
    Liveness { silent_for: Duration },
    /// Connection quality tier changed
    QualityChanged {
        from: QualityTier,
        to: QualityTier,
    },
    AlertRaised(Alert),
    AlertCleared(AlertId),
    /// A monitoring tick completed
    DiagnosticsUpdated { snapshot: PerformanceSnapshot },
}

/// Broadcast bus shared by all components
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Lossy when no receiver is subscribed.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
