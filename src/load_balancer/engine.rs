//! Load balancing engine.
//!
//! # Responsibilities
//! - Compose the registry, one selection algorithm and its statistics
//! - Expose the single contract the request-routing layer talks to
//! - Feed request outcomes back into health evaluation
//!
//! Errors from the registry and algorithm pass through unchanged.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BalancerConfig;
use crate::health::clock::{Clock, SystemClock};
use crate::health::evaluator::HealthThresholds;
use crate::load_balancer::error::Result;
use crate::load_balancer::registry::{PoolObserver, ServerRegistry};
use crate::load_balancer::server::{LoadBalancingContext, MetricsSnapshot, Server, ServerMetrics, ServerStatus};
use crate::load_balancer::stats::StatisticsSnapshot;
use crate::load_balancer::{AlgorithmKind, SelectionAlgorithm};

/// Builder for [`LoadBalancingEngine`].
pub struct EngineBuilder {
    thresholds: HealthThresholds,
    algorithm: Option<Box<dyn SelectionAlgorithm>>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn PoolObserver>>,
}

impl EngineBuilder {
    pub fn thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn algorithm(mut self, kind: AlgorithmKind) -> Self {
        self.algorithm = Some(kind.build());
        self
    }

    /// Use a custom selection strategy.
    pub fn custom_algorithm(mut self, algorithm: Box<dyn SelectionAlgorithm>) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observers fire in the order they are added here.
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> LoadBalancingEngine {
        let registry = self
            .observers
            .into_iter()
            .fold(ServerRegistry::with_clock(self.thresholds, self.clock), |reg, obs| {
                reg.with_observer(obs)
            });
        LoadBalancingEngine {
            registry: Arc::new(registry),
            algorithm: self
                .algorithm
                .unwrap_or_else(|| AlgorithmKind::default().build()),
        }
    }
}

/// The façade over registry, algorithm and statistics.
pub struct LoadBalancingEngine {
    registry: Arc<ServerRegistry>,
    algorithm: Box<dyn SelectionAlgorithm>,
}

impl LoadBalancingEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            thresholds: HealthThresholds::default(),
            algorithm: None,
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
        }
    }

    /// Round-robin engine with default thresholds.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Build an engine and load the configured initial pool.
    pub fn from_config(config: &BalancerConfig, observers: Vec<Arc<dyn PoolObserver>>) -> Result<Self> {
        let engine = observers
            .into_iter()
            .fold(Self::builder(), EngineBuilder::observer)
            .thresholds(config.health.thresholds())
            .algorithm(config.algorithm)
            .build();
        for server in &config.servers {
            engine.add_server(server.to_server())?;
        }
        tracing::info!(
            algorithm = engine.algorithm_name(),
            servers = engine.registry.len(),
            "Load balancing engine initialised"
        );
        Ok(engine)
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Pick a server for one request. Never blocks on other requests.
    pub fn select_server(&self, context: &LoadBalancingContext) -> Result<Server> {
        self.algorithm.select(&self.registry, context)
    }

    /// Select a server and hold a connection slot on it until the lease drops.
    pub fn lease(&self, context: &LoadBalancingContext) -> Result<ServerLease<'_>> {
        let server = self.select_server(context)?;
        self.registry.connection_opened(server.id())?;
        Ok(ServerLease { engine: self, server })
    }

    pub fn add_server(&self, server: Server) -> Result<()> {
        self.registry.add_server(server)
    }

    pub fn remove_server(&self, server_id: &str) -> Result<Server> {
        let stats = self.algorithm.statistics();
        self.registry
            .remove_server_with(server_id, |server| stats.forget(server.id()))
    }

    pub fn get_server(&self, server_id: &str) -> Result<Server> {
        self.registry.get_server(server_id)
    }

    pub fn get_metrics(&self, server_id: &str) -> Result<ServerMetrics> {
        self.registry.get_metrics(server_id)
    }

    pub fn get_healthy_servers(&self) -> Vec<Server> {
        self.registry.get_healthy_servers()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.registry.servers()
    }

    /// Record how a request to `server_id` went and let health react to it.
    pub fn report_outcome(&self, server_id: &str, success: bool, latency: Duration) -> Result<ServerStatus> {
        let observed_at = self.registry.clock().now();
        let snapshot = if success {
            MetricsSnapshot::success(latency, observed_at)
        } else {
            MetricsSnapshot::failure(latency, observed_at)
        };
        let stats = self.algorithm.statistics();
        self.registry
            .update_server_metrics_with(server_id, &snapshot, |server| {
                stats.record_outcome(server.id(), success)
            })
    }

    /// Entry point for the health prober.
    pub fn update_server_metrics(&self, server_id: &str, snapshot: &MetricsSnapshot) -> Result<ServerStatus> {
        self.registry.update_server_metrics(server_id, snapshot)
    }

    pub fn update_server_status(&self, server_id: &str, status: ServerStatus) -> Result<()> {
        self.registry.update_server_status(server_id, status)
    }

    /// Zero selection statistics and per-server request counters in one
    /// step under the registry lock.
    pub fn reset_statistics(&self) {
        let stats = self.algorithm.statistics();
        self.registry.reset_statistics_with(|| stats.reset());
        tracing::info!("Statistics reset");
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        let stats = self.algorithm.statistics();
        self.registry.with_counts(|servers, healthy| {
            let mut snapshot = stats.snapshot();
            snapshot.server_count = servers;
            snapshot.healthy_server_count = healthy;
            snapshot
        })
    }
}

impl Default for LoadBalancingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoadBalancingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (servers: {}, healthy: {})",
            self.algorithm.name(),
            self.registry.len(),
            self.registry.healthy_len()
        )
    }
}

impl fmt::Debug for LoadBalancingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancingEngine")
            .field("algorithm", &self.algorithm)
            .field("registry", &self.registry)
            .finish()
    }
}

/// A RAII guard that holds one active connection on the selected server.
#[derive(Debug)]
pub struct ServerLease<'a> {
    engine: &'a LoadBalancingEngine,
    server: Server,
}

impl ServerLease<'_> {
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Report the request outcome and release the connection.
    pub fn complete(self, success: bool, latency: Duration) -> Result<ServerStatus> {
        self.engine.report_outcome(self.server.id(), success, latency)
    }
}

impl Deref for ServerLease<'_> {
    type Target = Server;
    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

impl Drop for ServerLease<'_> {
    fn drop(&mut self) {
        // The server may have been removed while the request was in flight.
        let _ = self.engine.registry.connection_closed(self.server.id());
    }
}
