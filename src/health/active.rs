//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every server in the pool, all servers at once
//! - Bound each probe by a timeout; a timeout counts as a failed probe
//! - Push the result into the engine as a metrics snapshot
//! - Demote servers whose metrics went stale

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time;

use crate::config::HealthConfig;
use crate::load_balancer::error::LoadBalancerError;
use crate::load_balancer::server::{MetricsSnapshot, Server, ServerStatus};
use crate::load_balancer::LoadBalancingEngine;
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("server reported unhealthy: {0}")]
    Unhealthy(String),
}

/// Transport used to check one server.
pub trait Probe: Send + Sync {
    fn probe(&self, server: &Server) -> impl Future<Output = Result<(), ProbeError>> + Send;
}

impl<P: Probe> Probe for Arc<P> {
    fn probe(&self, server: &Server) -> impl Future<Output = Result<(), ProbeError>> + Send {
        (**self).probe(server)
    }
}

/// Healthy when a TCP connection can be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    async fn probe(&self, server: &Server) -> Result<(), ProbeError> {
        TcpStream::connect((server.address.as_str(), server.port)).await?;
        Ok(())
    }
}

pub struct HealthMonitor<P> {
    engine: Arc<LoadBalancingEngine>,
    probe: Arc<P>,
    interval: Duration,
    timeout: Duration,
}

impl<P: Probe + 'static> HealthMonitor<P> {
    pub fn new(engine: Arc<LoadBalancingEngine>, probe: P, config: &HealthConfig) -> Self {
        Self {
            engine,
            probe: Arc::new(probe),
            interval: config.probe_interval(),
            timeout: config.probe_timeout(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Health monitor starting"
        );

        let start = time::Instant::now() + start_jitter(self.interval);
        let mut ticker = time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every server concurrently, then sweep for stale metrics among
    /// the servers this round did not refresh.
    /// Returns the number of servers probed.
    pub async fn check_all(&self) -> usize {
        let mut probes = JoinSet::new();
        for server in self.engine.servers() {
            if server.status() == ServerStatus::Maintenance {
                continue;
            }
            let engine = self.engine.clone();
            let probe = self.probe.clone();
            let timeout = self.timeout;
            probes.spawn(async move { check(&engine, &*probe, &server, timeout).await });
        }

        let mut probed = 0;
        let mut refreshed = HashSet::new();
        while let Some(joined) = probes.join_next().await {
            probed += 1;
            match joined {
                Ok(Some(id)) => {
                    refreshed.insert(id);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Health check task failed"),
            }
        }

        self.engine.registry().evaluate_staleness_except(&refreshed);
        probed
    }
}

/// Probe one server and record the result. Returns the server id when the
/// result was recorded.
async fn check<P: Probe>(
    engine: &LoadBalancingEngine,
    probe: &P,
    server: &Server,
    timeout: Duration,
) -> Option<String> {
    let observed_at = engine.registry().clock().now();
    let started = Instant::now();

    let outcome = match time::timeout(timeout, probe.probe(server)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    };
    let latency = started.elapsed();
    metrics::record_probe(server.id(), latency);

    let snapshot = match outcome {
        Ok(()) => MetricsSnapshot::success(latency, observed_at),
        Err(e) => {
            tracing::warn!(server = %server.id(), endpoint = %server.endpoint(), error = %e, "Health check failed");
            MetricsSnapshot::failure(latency, observed_at)
        }
    };

    match engine.update_server_metrics(server.id(), &snapshot) {
        Ok(_) => Some(server.id().to_string()),
        Err(LoadBalancerError::ServerNotFound { .. }) => {
            tracing::debug!(server = %server.id(), "Server removed during health check");
            None
        }
        Err(e) => {
            tracing::error!(server = %server.id(), error = %e, "Failed to record health check");
            None
        }
    }
}

/// Up to a tenth of the interval, so co-started monitors do not probe in lockstep.
fn start_jitter(interval: Duration) -> Duration {
    let max_ms = (interval.as_millis() / 10) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
