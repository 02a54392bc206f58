//! Trend detection over the snapshot history.
//!
//! Direction comes from pairwise comparisons across the recent window;
//! strength normalizes the total movement into [0, 1]:
//! sum of |deltas| over sum of pairwise maxima.

use serde::Serialize;

use super::history::PerformanceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendDirection {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// Normalized movement in [0, 1]
    pub strength: f64,
}

impl Trend {
    pub fn stable() -> Self {
        Self {
            direction: TrendDirection::Stable,
            strength: 0.0,
        }
    }
}

/// Trends for the tracked metrics. Recomputed per tick, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendAnalysis {
    pub latency: Trend,
    pub success_rate: Trend,
}

impl Default for TrendAnalysis {
    fn default() -> Self {
        Self {
            latency: Trend::stable(),
            success_rate: Trend::stable(),
        }
    }
}

impl TrendAnalysis {
    /// Analyze the last `window` snapshots that carried samples
    pub fn from_snapshots<'a, I>(snapshots: I, window: usize) -> Self
    where
        I: IntoIterator<Item = &'a PerformanceSnapshot>,
    {
        let populated: Vec<&PerformanceSnapshot> = snapshots
            .into_iter()
            .filter(|s| s.sample_count > 0)
            .collect();
        let tail = &populated[populated.len().saturating_sub(window)..];

        let latency_series: Vec<f64> = tail
            .iter()
            .map(|s| s.avg_latency.as_secs_f64() * 1000.0)
            .collect();
        let success_series: Vec<f64> = tail.iter().map(|s| s.success_rate).collect();

        Self {
            latency: analyze(&latency_series),
            success_rate: analyze(&success_series),
        }
    }
}

/// Pairwise trend over a series of metric values
pub fn analyze(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::stable();
    }

    let mut increases = 0u32;
    let mut decreases = 0u32;
    let mut delta_sum = 0.0;
    let mut max_sum = 0.0;

    for pair in values.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            increases += 1;
        } else if delta < 0.0 {
            decreases += 1;
        }
        delta_sum += delta.abs();
        max_sum += pair[0].max(pair[1]);
    }

    let direction = if increases > decreases {
        TrendDirection::Increasing
    } else if decreases > increases {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    let strength = if max_sum > 0.0 {
        (delta_sum / max_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Trend {
        direction,
        strength,
    }
}
