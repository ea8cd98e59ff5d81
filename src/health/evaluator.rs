//! Health evaluation policy.
//!
//! # Policy
//! ```text
//! stale (now - last_updated > stale_after)     → Unhealthy
//! failure ratio over window > max_failure_ratio → Unhealthy
//!   (only once min_samples outcomes exist)
//! otherwise                                     → Healthy
//! ```
//!
//! Pure: no I/O, no registry access.

use std::time::{Duration, SystemTime};

use crate::load_balancer::server::{ServerMetrics, ServerStatus};

/// Thresholds the evaluator and registry run with.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Metrics older than this are not trusted.
    pub stale_after: Duration,
    /// Failure share above which a server is unhealthy.
    pub max_failure_ratio: f64,
    /// Outcomes required before the ratio is considered.
    pub min_samples: usize,
    /// Size of the rolling outcome window.
    pub window: usize,
    /// Whether never-probed servers are eligible for selection.
    pub admit_unknown: bool,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            max_failure_ratio: 0.5,
            min_samples: 3,
            window: 10,
            admit_unknown: true,
        }
    }
}

/// Derive a status from a metrics snapshot as of `now`.
pub fn evaluate(metrics: &ServerMetrics, thresholds: &HealthThresholds, now: SystemTime) -> ServerStatus {
    if metrics.is_stale_at(now, thresholds.stale_after) {
        return ServerStatus::Unhealthy;
    }

    if metrics.recent_samples() >= thresholds.min_samples {
        if let Some(ratio) = metrics.failure_ratio() {
            if ratio > thresholds.max_failure_ratio {
                return ServerStatus::Unhealthy;
            }
        }
    }

    ServerStatus::Healthy
}
