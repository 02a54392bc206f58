//! Tablelink - network resilience core for a real-time casino-table client.
//!
//! Keeps an authoritative view of table state over an unreliable link:
//! - `api`: HTTP request pipeline with retry/backoff and interceptors
//! - `realtime`: reconnecting channel with heartbeat, offline queueing, and
//!   the inbound message dispatcher
//! - `monitor`: probe engine, rolling metrics, quality tiers, trends, alerts
//!
//! Components are wired together by an explicit composition root (see the
//! `tablelink` binary); there are no global singletons.

pub mod api;
pub mod config;
pub mod events;
pub mod monitor;
pub mod realtime;

pub use api::{ApiClient, ApiError, ApiErrorKind};
pub use config::{Endpoint, NetworkConfig};
pub use events::{EventBus, NetworkEvent};
pub use monitor::{ConnectionMonitor, MonitorReport, QualityTier};
pub use realtime::{ConnectionState, MessageDispatcher, RealtimeChannel, WsTransport};
