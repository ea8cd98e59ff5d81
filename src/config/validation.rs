//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Reject duplicate server ids before the registry ever sees them
//! - Validate value ranges (ratios, windows, durations, ports)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::BalancerConfig;
use crate::load_balancer::error::ConfigViolation;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("duplicate server id {0:?}")]
    DuplicateServerId(String),

    #[error("server {id:?}: {violation}")]
    InvalidServer { id: String, violation: ConfigViolation },

    #[error("health.max_failure_ratio {0} must be within 0.0..=1.0")]
    FailureRatioOutOfRange(f64),

    #[error("health.window must be at least 1")]
    EmptyWindow,

    #[error("health.min_samples {min_samples} exceeds health.window {window}")]
    MinSamplesExceedWindow { min_samples: usize, window: usize },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for server in &config.servers {
        if !seen.insert(server.id.as_str()) {
            errors.push(ValidationError::DuplicateServerId(server.id.clone()));
        }
        for violation in server.to_server().violations() {
            errors.push(ValidationError::InvalidServer {
                id: server.id.clone(),
                violation,
            });
        }
    }

    let health = &config.health;
    if !(0.0..=1.0).contains(&health.max_failure_ratio) {
        errors.push(ValidationError::FailureRatioOutOfRange(health.max_failure_ratio));
    }
    if health.window == 0 {
        errors.push(ValidationError::EmptyWindow);
    } else if health.min_samples > health.window {
        errors.push(ValidationError::MinSamplesExceedWindow {
            min_samples: health.min_samples,
            window: health.window,
        });
    }
    if health.stale_after_secs == 0 {
        errors.push(ValidationError::ZeroDuration("health.stale_after_secs"));
    }
    if health.probe_enabled {
        if health.probe_interval_secs == 0 {
            errors.push(ValidationError::ZeroDuration("health.probe_interval_secs"));
        }
        if health.probe_timeout_ms == 0 {
            errors.push(ValidationError::ZeroDuration("health.probe_timeout_ms"));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
