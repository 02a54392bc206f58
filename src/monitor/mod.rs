//! Connection health monitor.
//!
//! Drives periodic probe rounds, folds results into rolling metrics,
//! classifies a quality tier, runs trend analysis, and keeps the
//! deduplicated alert set. History, snapshots, and alerts are mutated only
//! by the monitor's own loop; everyone else gets immutable copies.

pub mod alerts;
pub mod history;
pub mod probe;
pub mod quality;
pub mod trend;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::events::{EventBus, NetworkEvent};
use crate::realtime::channel::ConnectionState;

pub use alerts::{Alert, AlertId, AlertSet, AlertSeverity};
pub use history::{PerformanceSnapshot, ProbeHistory};
pub use probe::{ProbeEngine, ProbeResult};
pub use quality::QualityTier;
pub use trend::{Trend, TrendAnalysis, TrendDirection};

/// Immutable diagnostics value for UIs. Structurally equal across calls
/// when no monitoring tick ran in between.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    /// Time of the last completed monitoring tick
    pub generated_at: Option<DateTime<Utc>>,
    pub connection_state: ConnectionState,
    pub quality: QualityTier,
    pub current: Option<PerformanceSnapshot>,
    pub history: Vec<PerformanceSnapshot>,
    pub trend: TrendAnalysis,
    pub active_alerts: Vec<Alert>,
    pub rounds: u64,
}

struct MonitorInner {
    history: ProbeHistory,
    snapshots: VecDeque<PerformanceSnapshot>,
    quality: QualityTier,
    trend: TrendAnalysis,
    alerts: AlertSet,
    consecutive_failures: u32,
    last_evaluated: Option<DateTime<Utc>>,
    rounds: u64,
}

/// The connection monitor
pub struct ConnectionMonitor {
    config: MonitorConfig,
    probe: ProbeEngine,
    events: EventBus,
    /// Observed, never driven: the channel owns its state
    channel_state: watch::Receiver<ConnectionState>,
    inner: RwLock<MonitorInner>,
}

impl ConnectionMonitor {
    pub fn new(
        config: MonitorConfig,
        events: EventBus,
        channel_state: watch::Receiver<ConnectionState>,
    ) -> anyhow::Result<Arc<Self>> {
        let probe = ProbeEngine::new(&config)?;
        let inner = MonitorInner {
            history: ProbeHistory::new(config.history_capacity),
            snapshots: VecDeque::with_capacity(config.snapshot_history),
            quality: QualityTier::Unknown,
            trend: TrendAnalysis::default(),
            alerts: AlertSet::new(),
            consecutive_failures: 0,
            last_evaluated: None,
            rounds: 0,
        };
        Ok(Arc::new(Self {
            config,
            probe,
            events,
            channel_state,
            inner: RwLock::new(inner),
        }))
    }

    /// Periodic driver: probe round, then recompute. Cancels cleanly on
    /// shutdown without leaking the round in flight.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "starting connection monitor ({} endpoints every {:?})",
            self.config.endpoints.len(),
            self.config.monitoring_interval
        );
        let mut tick = interval(self.config.monitoring_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            let round = self.probe.run_round(&self.config.endpoints).await;
            self.evaluate(round);
        }
        info!("connection monitor stopped");
    }

    pub fn quality(&self) -> QualityTier {
        self.inner.read().quality
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner.read().alerts.active()
    }

    /// Fold one completed probe round into history, snapshot, quality,
    /// trend, and alert state. The round is joined before this runs, so the
    /// snapshot never sees a partial window.
    pub fn evaluate(&self, round: Vec<ProbeResult>) {
        let channel_state = *self.channel_state.borrow();
        let mut inner = self.inner.write();
        inner.rounds += 1;

        for result in round {
            if result.success {
                inner.consecutive_failures = 0;
            } else {
                inner.consecutive_failures += 1;
            }
            inner.history.push(result);
        }

        let snapshot = inner.history.snapshot(self.config.snapshot_window);
        inner.snapshots.push_back(snapshot.clone());
        while inner.snapshots.len() > self.config.snapshot_history {
            inner.snapshots.pop_front();
        }

        let tier = quality::classify(&snapshot, &self.config.quality);
        if tier != inner.quality {
            info!("connection quality {} -> {}", inner.quality, tier);
            self.events.emit(NetworkEvent::QualityChanged {
                from: inner.quality,
                to: tier,
            });
            inner.quality = tier;
        }

        let trend = TrendAnalysis::from_snapshots(inner.snapshots.iter(), self.config.trend_window);
        inner.trend = trend;

        self.evaluate_alerts(&mut inner, channel_state);

        inner.last_evaluated = Some(Utc::now());
        self.events
            .emit(NetworkEvent::DiagnosticsUpdated { snapshot });
    }

    fn evaluate_alerts(&self, inner: &mut MonitorInner, channel_state: ConnectionState) {
        let thresholds = self.config.alerts.clone();

        let failures = inner.consecutive_failures;
        self.apply_condition(
            inner,
            AlertId::ConsecutiveFailures,
            failures >= thresholds.consecutive_failures,
            || Alert::consecutive_failures(failures, thresholds.consecutive_failures),
        );

        let pair = {
            let n = inner.snapshots.len();
            if n >= 2 {
                Some((inner.snapshots[n - 2].clone(), inner.snapshots[n - 1].clone()))
            } else {
                None
            }
        };
        if let Some((previous, current)) = pair {
            let both_populated = previous.sample_count > 0 && current.sample_count > 0;

            let previous_ms = previous.avg_latency.as_secs_f64() * 1000.0;
            let current_ms = current.avg_latency.as_secs_f64() * 1000.0;
            let degraded = both_populated
                && previous_ms > 0.0
                && current_ms / previous_ms >= thresholds.latency_degradation_factor;
            self.apply_condition(inner, AlertId::LatencyDegradation, degraded, || {
                Alert::latency_degradation(current_ms / previous_ms, current_ms, previous_ms)
            });

            let drop = previous.success_rate - current.success_rate;
            let dropped = both_populated && drop >= thresholds.success_rate_drop;
            self.apply_condition(inner, AlertId::SuccessRateDrop, dropped, || {
                Alert::success_rate_drop(previous.success_rate, current.success_rate)
            });
        }

        // Critical while the table feed is down. Error counts: that is the
        // terminal state after the reconnect budget is spent.
        let lost = matches!(
            channel_state,
            ConnectionState::Disconnected | ConnectionState::Error
        );
        self.apply_condition(inner, AlertId::ConnectionLost, lost, || {
            Alert::connection_lost(&channel_state.to_string())
        });

        let latency_trend = inner.trend.latency.clone();
        let trending_up = latency_trend.direction == TrendDirection::Increasing
            && latency_trend.strength > thresholds.trend_strength;
        self.apply_condition(inner, AlertId::TrendWarning, trending_up, || {
            Alert::trend_warning(latency_trend.strength)
        });
    }

    fn apply_condition(
        &self,
        inner: &mut MonitorInner,
        id: AlertId,
        active: bool,
        make: impl FnOnce() -> Alert,
    ) {
        if active {
            if !inner.alerts.contains(id) {
                let alert = make();
                warn!("alert raised: {} - {}", id, alert.message);
                self.events.emit(NetworkEvent::AlertRaised(alert.clone()));
                inner.alerts.raise(alert);
            }
        } else if inner.alerts.clear(id).is_some() {
            info!("alert cleared: {}", id);
            self.events.emit(NetworkEvent::AlertCleared(id));
        }
    }

    /// Assemble the current diagnostics into one immutable value
    pub fn generate_report(&self) -> MonitorReport {
        let inner = self.inner.read();
        MonitorReport {
            generated_at: inner.last_evaluated,
            connection_state: *self.channel_state.borrow(),
            quality: inner.quality,
            current: inner.snapshots.back().cloned(),
            history: inner.snapshots.iter().cloned().collect(),
            trend: inner.trend.clone(),
            active_alerts: inner.alerts.active(),
            rounds: inner.rounds,
        }
    }
}
