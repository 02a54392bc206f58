//! HTTP reachability probes with bounded concurrency.
//!
//! One GET per endpoint per round, fanned out under a counting semaphore and
//! joined before the round returns, so metrics never see a partial round.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{Endpoint, MonitorConfig};

/// Outcome of one reachability check
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub endpoint: String,
    pub success: bool,
    pub latency: Duration,
    /// 0 when no HTTP response was received
    pub status: u16,
    pub error: Option<String>,
    pub at: Instant,
}

impl ProbeResult {
    pub fn ok(endpoint: &str, latency: Duration) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            success: true,
            latency,
            status: 200,
            error: None,
            at: Instant::now(),
        }
    }

    pub fn failed(endpoint: &str, error: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            success: false,
            latency: Duration::ZERO,
            status: 0,
            error: Some(error.to_string()),
            at: Instant::now(),
        }
    }
}

/// Bounded-concurrency probe runner
pub struct ProbeEngine {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ProbeEngine {
    pub fn new(config: &MonitorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .context("Failed to build probe client")?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            timeout: config.probe_timeout,
        })
    }

    /// Probe every endpoint once. Probes run concurrently up to the
    /// semaphore cap and may complete in any order; results come back in
    /// endpoint order.
    pub async fn run_round(&self, endpoints: &[Endpoint]) -> Vec<ProbeResult> {
        let mut set = JoinSet::new();
        for (idx, endpoint) in endpoints.iter().cloned().enumerate() {
            let client = self.client.clone();
            let semaphore = self.semaphore.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, ProbeResult::failed(&endpoint.name, "probe pool closed")),
                };
                (idx, probe_endpoint(&client, &endpoint, timeout).await)
            });
        }

        let mut indexed: Vec<(usize, ProbeResult)> = Vec::with_capacity(endpoints.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(e) => warn!("probe task failed to join: {}", e),
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}

async fn probe_endpoint(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    timeout: Duration,
) -> ProbeResult {
    let started = Instant::now();
    match client.get(&endpoint.url).timeout(timeout).send().await {
        Ok(resp) => {
            let latency = started.elapsed();
            let status = resp.status().as_u16();
            let success = resp.status().is_success();
            if success {
                debug!("probe {} ok in {:?}", endpoint.name, latency);
            } else {
                warn!("probe {} returned {}", endpoint.name, status);
            }
            ProbeResult {
                endpoint: endpoint.name.clone(),
                success,
                latency,
                status,
                error: (!success).then(|| format!("status {}", status)),
                at: Instant::now(),
            }
        }
        Err(e) => {
            warn!("probe {} failed: {}", endpoint.name, e);
            ProbeResult {
                endpoint: endpoint.name.clone(),
                success: false,
                latency: started.elapsed(),
                status: 0,
                error: Some(e.to_string()),
                at: Instant::now(),
            }
        }
    }
}
