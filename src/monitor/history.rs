//! Bounded probe history and derived performance snapshots.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::probe::ProbeResult;

/// Derived view of the trailing probe window. Never mutated after creation;
/// superseded by the next snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub success_rate: f64,
    /// Latency aggregates cover successful probes only
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// All probes (success and failure) inside the window
    pub sample_count: usize,
    pub taken_at: DateTime<Utc>,
}

/// Ring buffer of probe results, oldest evicted on overflow
#[derive(Debug)]
pub struct ProbeHistory {
    results: VecDeque<ProbeResult>,
    capacity: usize,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            results: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, result: ProbeResult) {
        if self.results.len() >= self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Compute a snapshot over the trailing `window`
    pub fn snapshot(&self, window: Duration) -> PerformanceSnapshot {
        let cutoff = Instant::now().checked_sub(window);
        let recent: Vec<&ProbeResult> = self
            .results
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.at >= c))
            .collect();

        let sample_count = recent.len();
        let successes: Vec<Duration> = recent
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency)
            .collect();

        let success_rate = if sample_count == 0 {
            0.0
        } else {
            successes.len() as f64 / sample_count as f64
        };

        let (avg, min, max) = if successes.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            let sum: Duration = successes.iter().sum();
            let avg = sum / successes.len() as u32;
            let min = successes.iter().min().copied().unwrap_or(Duration::ZERO);
            let max = successes.iter().max().copied().unwrap_or(Duration::ZERO);
            (avg, min, max)
        };

        PerformanceSnapshot {
            success_rate,
            avg_latency: avg,
            min_latency: min,
            max_latency: max,
            sample_count,
            taken_at: Utc::now(),
        }
    }
}
