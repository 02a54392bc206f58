//! Configuration surface for the network core.
//!
//! All tunables are supplied at construction time as one `NetworkConfig`
//! value; nothing in the core reads the environment on its own. The binary
//! builds the config once via `NetworkConfig::from_env()` and hands each
//! component its section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A probe/call target. Immutable once configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Human-readable name, used as the key in probe history and alerts
    pub name: String,
    /// Full URL for the reachability check
    pub url: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Top-level configuration for the network core
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub api: ApiConfig,
    pub channel: ChannelConfig,
    pub monitor: MonitorConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let api = ApiConfig::default();
        let monitor = MonitorConfig {
            endpoints: vec![Endpoint::new(
                "api-health",
                format!("{}/health", api.base_url),
            )],
            ..MonitorConfig::default()
        };
        Self {
            api,
            channel: ChannelConfig::default(),
            monitor,
        }
    }
}

impl NetworkConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TABLELINK_API_BASE_URL") {
            config.api.base_url = v;
            config.monitor.endpoints = vec![Endpoint::new(
                "api-health",
                format!("{}/health", config.api.base_url),
            )];
        }
        if let Ok(v) = std::env::var("TABLELINK_AUTH_TOKEN") {
            config.api.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("TABLELINK_MAX_RETRIES") {
            config.api.max_retries = v.parse().unwrap_or(config.api.max_retries);
        }
        if let Ok(v) = std::env::var("TABLELINK_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                config.api.request_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("TABLELINK_WS_URL") {
            config.channel.url = v;
        }
        if let Ok(v) = std::env::var("TABLELINK_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse() {
                config.channel.heartbeat_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("TABLELINK_MAX_RECONNECT_ATTEMPTS") {
            config.channel.max_reconnect_attempts =
                v.parse().unwrap_or(config.channel.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("TABLELINK_MONITOR_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                config.monitor.monitoring_interval = Duration::from_millis(ms);
            }
        }
        // Comma-separated "name=url" pairs
        if let Ok(v) = std::env::var("TABLELINK_PROBE_ENDPOINTS") {
            let endpoints: Vec<Endpoint> = v
                .split(',')
                .filter_map(|pair| {
                    let (name, url) = pair.split_once('=')?;
                    Some(Endpoint::new(name.trim(), url.trim()))
                })
                .collect();
            if !endpoints.is_empty() {
                config.monitor.endpoints = endpoints;
            }
        }

        config
    }
}

/// Request pipeline configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL joined with request paths
    pub base_url: String,
    /// Bearer token attached to every request when present
    pub auth_token: Option<String>,
    /// Default per-request timeout
    pub request_timeout: Duration,
    /// Retries after the initial attempt, transport-level failures only
    pub max_retries: u32,
    /// Unit for the 2^attempt retry delay curve
    pub retry_backoff_unit: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.tablelink.example".into(),
            auth_token: None,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_unit: Duration::from_millis(500),
        }
    }
}

/// Realtime channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL for the table feed
    pub url: String,
    pub connect_timeout: Duration,

    // Reconnect policy
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffConfig,

    // Heartbeat
    pub heartbeat_interval: Duration,
    /// Silence beyond stale_multiplier * heartbeat_interval is reported
    pub stale_multiplier: u32,
    /// Blend factor for the rolling latency estimate
    pub latency_alpha: f64,

    // Outbound queueing while not connected
    pub queue_outbound: bool,
    pub max_queue_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "wss://rt.tablelink.example/table".into(),
            connect_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(15),
            stale_multiplier: 3,
            latency_alpha: 0.2,
            queue_outbound: true,
            max_queue_size: 256,
        }
    }
}

/// Reconnect backoff parameters
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// +/- fraction of the capped delay
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        // 250ms base, 2x multiplier, 30s cap, +/-30% jitter
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

/// Connection monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Endpoints probed every round
    pub endpoints: Vec<Endpoint>,
    pub monitoring_interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,

    /// Probe history ring buffer capacity
    pub history_capacity: usize,
    /// Trailing window a snapshot is computed over
    pub snapshot_window: Duration,
    /// Snapshots retained for trend analysis and reports
    pub snapshot_history: usize,
    /// Snapshots considered by trend analysis
    pub trend_window: usize,

    pub quality: QualityThresholds,
    pub alerts: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            monitoring_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 4,
            history_capacity: 512,
            snapshot_window: Duration::from_secs(300),
            snapshot_history: 20,
            trend_window: 5,
            quality: QualityThresholds::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

/// Quality tier classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Below this success rate the connection is Poor regardless of latency
    pub min_success_rate: f64,
    pub excellent_latency: Duration,
    pub good_latency: Duration,
    pub poor_latency: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            excellent_latency: Duration::from_millis(50),
            good_latency: Duration::from_millis(150),
            poor_latency: Duration::from_millis(400),
        }
    }
}

/// Alert condition thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub consecutive_failures: u32,
    /// current avg latency / previous avg latency
    pub latency_degradation_factor: f64,
    /// previous success rate - current success rate
    pub success_rate_drop: f64,
    /// Latency trend strength above which a warning is raised
    pub trend_strength: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            consecutive_failures: 3,
            latency_degradation_factor: 2.0,
            success_rate_drop: 0.3,
            trend_strength: 0.6,
        }
    }
}
