//! Quality tier classification.
//!
//! A pure function of one snapshot. Ordered rules, first match wins: an
//! unhealthy success rate is Poor no matter how fast the survivors were.

use serde::Serialize;

use crate::config::QualityThresholds;

use super::history::PerformanceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityTier {
    /// No samples yet
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Poor => write!(f, "poor"),
            Self::Fair => write!(f, "fair"),
            Self::Good => write!(f, "good"),
            Self::Excellent => write!(f, "excellent"),
        }
    }
}

pub fn classify(snapshot: &PerformanceSnapshot, thresholds: &QualityThresholds) -> QualityTier {
    if snapshot.sample_count == 0 {
        return QualityTier::Unknown;
    }
    if snapshot.success_rate <= 0.0 {
        return QualityTier::Poor;
    }
    if snapshot.success_rate < thresholds.min_success_rate {
        return QualityTier::Poor;
    }

    let avg = snapshot.avg_latency;
    if avg <= thresholds.excellent_latency {
        QualityTier::Excellent
    } else if avg <= thresholds.good_latency {
        QualityTier::Good
    } else if avg <= thresholds.poor_latency {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    }
}
