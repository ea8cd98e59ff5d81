//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::evaluator::HealthThresholds;
use crate::load_balancer::server::Server;
use crate::load_balancer::AlgorithmKind;

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Selection algorithm.
    pub algorithm: AlgorithmKind,

    /// Initial server pool.
    pub servers: Vec<ServerConfig>,

    /// Health evaluation and probing settings.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Backend server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub id: String,

    /// Host name or IP address.
    pub address: String,

    pub port: u16,

    /// Weight for weighted load balancing (default: 1.0).
    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

impl ServerConfig {
    pub fn to_server(&self) -> Server {
        let server = Server::new(self.id.clone(), self.address.clone(), self.port).with_weight(self.weight);
        self.metadata
            .iter()
            .fold(server, |s, (k, v)| s.with_metadata(k.clone(), v.clone()))
    }
}

/// Health configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Metrics older than this many seconds are stale.
    pub stale_after_secs: u64,

    /// Failure share above which a server is unhealthy.
    pub max_failure_ratio: f64,

    /// Outcomes required before the failure ratio applies.
    pub min_samples: usize,

    /// Number of recent outcomes kept per server.
    pub window: usize,

    /// Route traffic to servers that have not been probed yet.
    pub admit_unknown: bool,

    /// Enable the active prober.
    pub probe_enabled: bool,

    /// Probe interval in seconds.
    pub probe_interval_secs: u64,

    /// Probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
            max_failure_ratio: 0.5,
            min_samples: 3,
            window: 10,
            admit_unknown: true,
            probe_enabled: true,
            probe_interval_secs: 10,
            probe_timeout_ms: 2000,
        }
    }
}

impl HealthConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_secs(self.stale_after_secs),
            max_failure_ratio: self.max_failure_ratio,
            min_samples: self.min_samples,
            window: self.window,
            admit_unknown: self.admit_unknown,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
