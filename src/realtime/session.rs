//! Session-level policies for the realtime channel:
//! reconnect backoff and heartbeat tracking.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::BackoffConfig;

// =============================================================================
// EXPONENTIAL BACKOFF WITH JITTER
// =============================================================================

/// Backoff calculator with jitter for thundering herd prevention
#[derive(Debug)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Compute next backoff duration with jitter
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.config.base.as_millis() as f64
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max.as_millis() as f64);

        // Jitter: +/- jitter_factor (e.g. +/-30%)
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.config.base.as_millis() as f64);

        self.attempt += 1;

        Duration::from_millis(final_ms as u64)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// HEARTBEAT TRACKING
// =============================================================================

/// What the session loop should do after a heartbeat check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due
    Idle,
    /// Time to send a ping token
    SendPing,
    /// Inbound silence exceeded the staleness bound; report, don't disconnect
    ReportStale(Duration),
}

/// Tracks ping cadence, pong round-trips, and inbound silence.
///
/// Staleness is a liveness *report*: the channel keeps streaming and the
/// consumer decides what to do about it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    stale_after: Duration,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_inbound: Instant,
    stale_reported: bool,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, stale_multiplier: u32) -> Self {
        Self {
            interval,
            stale_after: interval * stale_multiplier.max(1),
            last_ping_sent: None,
            awaiting_pong: false,
            last_inbound: Instant::now(),
            stale_reported: false,
        }
    }

    /// Reset state for a new connection
    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.awaiting_pong = false;
        self.last_inbound = Instant::now();
        self.stale_reported = false;
    }

    /// Record that anything arrived from the server
    #[inline]
    pub fn record_inbound(&mut self) {
        self.last_inbound = Instant::now();
        self.stale_reported = false;
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    /// Record a pong; returns the round-trip time when one was pending
    pub fn record_pong(&mut self) -> Option<Duration> {
        if !self.awaiting_pong {
            return None;
        }
        self.awaiting_pong = false;
        self.last_ping_sent.map(|sent| sent.elapsed())
    }

    /// Check heartbeat status and return the due action
    pub fn check(&mut self) -> HeartbeatAction {
        let silence = self.last_inbound.elapsed();
        if silence > self.stale_after && !self.stale_reported {
            self.stale_reported = true;
            return HeartbeatAction::ReportStale(silence);
        }

        let ping_due = match self.last_ping_sent {
            None => true,
            Some(sent) => sent.elapsed() >= self.interval,
        };
        if ping_due && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Idle
    }
}
