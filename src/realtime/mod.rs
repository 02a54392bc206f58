//! Realtime channel: transport abstraction, connection state machine,
//! heartbeat/backoff policies, and the inbound message dispatcher.

pub mod channel;
pub mod dispatch;
pub mod session;
pub mod transport;

pub use channel::{
    ChannelError, ChannelErrorKind, ChannelStats, ChannelStatsSnapshot, ConnectionState,
    InboundEnvelope, OutboundMessage, RealtimeChannel, PING_TOKEN, PONG_TOKEN,
};
pub use dispatch::{classify, topics, MessageDispatcher};
pub use session::{BackoffCalculator, HeartbeatAction, HeartbeatMonitor};
pub use transport::{Transport, TransportConnection, TransportEvent, WsTransport};
