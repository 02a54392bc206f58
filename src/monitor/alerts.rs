//! Deduplicated alert set.
//!
//! Each condition has a stable id; at most one alert per id is active at a
//! time. Raising an already-active id is a no-op, clearing removes the
//! alert entirely. Alerts signal sustained degraded states, not one-off
//! errors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stable condition ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlertId {
    ConsecutiveFailures,
    LatencyDegradation,
    SuccessRateDrop,
    ConnectionLost,
    TrendWarning,
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsecutiveFailures => write!(f, "consecutive_failures"),
            Self::LatencyDegradation => write!(f, "latency_degradation"),
            Self::SuccessRateDrop => write!(f, "success_rate_drop"),
            Self::ConnectionLost => write!(f, "connection_lost"),
            Self::TrendWarning => write!(f, "trend_warning"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A standing notification, active while its condition holds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub context: BTreeMap<String, String>,
}

impl Alert {
    fn new(id: AlertId, severity: AlertSeverity, title: &str, message: String) -> Self {
        Self {
            id,
            severity,
            title: title.to_string(),
            message,
            raised_at: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: String) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn consecutive_failures(count: u32, threshold: u32) -> Self {
        Self::new(
            AlertId::ConsecutiveFailures,
            AlertSeverity::High,
            "Consecutive probe failures",
            format!("{} probes failed in a row (threshold {})", count, threshold),
        )
        .with("count", count.to_string())
        .with("threshold", threshold.to_string())
    }

    pub fn latency_degradation(ratio: f64, current_ms: f64, previous_ms: f64) -> Self {
        Self::new(
            AlertId::LatencyDegradation,
            AlertSeverity::Medium,
            "Latency degradation",
            format!(
                "average latency rose from {:.0}ms to {:.0}ms ({:.2}x)",
                previous_ms, current_ms, ratio
            ),
        )
        .with("ratio", format!("{:.2}", ratio))
        .with("current_ms", format!("{:.1}", current_ms))
        .with("previous_ms", format!("{:.1}", previous_ms))
    }

    pub fn success_rate_drop(previous: f64, current: f64) -> Self {
        Self::new(
            AlertId::SuccessRateDrop,
            AlertSeverity::High,
            "Success rate drop",
            format!(
                "probe success rate fell from {:.0}% to {:.0}%",
                previous * 100.0,
                current * 100.0
            ),
        )
        .with("previous", format!("{:.3}", previous))
        .with("current", format!("{:.3}", current))
    }

    pub fn connection_lost(state: &str) -> Self {
        Self::new(
            AlertId::ConnectionLost,
            AlertSeverity::Critical,
            "Realtime connection lost",
            format!("table feed is down (channel state {})", state),
        )
        .with("state", state.to_string())
    }

    pub fn trend_warning(strength: f64) -> Self {
        Self::new(
            AlertId::TrendWarning,
            AlertSeverity::Low,
            "Latency trending up",
            format!("latency is increasing (trend strength {:.2})", strength),
        )
        .with("strength", format!("{:.3}", strength))
    }
}

/// At most one active alert per id
#[derive(Debug, Default)]
pub struct AlertSet {
    active: BTreeMap<AlertId, Alert>,
}

impl AlertSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an alert with the same id is already active.
    /// Returns whether the alert was newly raised.
    pub fn raise(&mut self, alert: Alert) -> bool {
        if self.active.contains_key(&alert.id) {
            return false;
        }
        self.active.insert(alert.id, alert);
        true
    }

    /// Remove the alert entirely (not merely flagged)
    pub fn clear(&mut self, id: AlertId) -> Option<Alert> {
        self.active.remove(&id)
    }

    pub fn contains(&self, id: AlertId) -> bool {
        self.active.contains_key(&id)
    }

    /// Active alerts in stable id order
    pub fn active(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
