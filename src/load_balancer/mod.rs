//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Caller builds LoadBalancingContext
//!     → engine.rs (select_server)
//!     → registry.rs (lock, expose healthy subset)
//!     → Apply selection algorithm:
//!         - round_robin.rs (rotate through healthy servers)
//!         - least_conn.rs (pick server with fewest connections)
//!     → stats.rs (count selection or failed selection)
//!     → Return a copy of the chosen Server or NoHealthyServers
//!
//! Prober / caller outcome
//!     → registry.rs (update_server_metrics)
//!     → health::evaluator (derive status)
//!     → healthy subset adjusted, observers notified
//! ```
//!
//! # Design Decisions
//! - Algorithms hold no server list; the registry is the single source of truth
//! - Selection runs inside the registry lock, so it never sees a torn subset
//! - Callers only ever receive copies of server records
//! - Selection never blocks waiting on another request

pub mod engine;
pub mod error;
pub mod least_conn;
pub mod registry;
pub mod round_robin;
pub mod server;
pub mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use engine::{LoadBalancingEngine, ServerLease};
pub use error::{ConfigViolation, LoadBalancerError, Result};
pub use registry::{HealthyView, PoolObserver, ServerRegistry};
pub use server::{LoadBalancingContext, MetricsSnapshot, Server, ServerMetrics, ServerStatus};
pub use stats::{Statistics, StatisticsSnapshot};

/// A server selection strategy.
pub trait SelectionAlgorithm: Send + Sync + fmt::Debug {
    /// Human-readable algorithm name.
    fn name(&self) -> &'static str;

    /// Choose an index into the healthy subset, or `None` when it is empty.
    ///
    /// Called with the registry lock held; must not block.
    fn pick(&self, healthy: &HealthyView<'_>, context: &LoadBalancingContext) -> Option<usize>;

    fn statistics(&self) -> &Statistics;

    /// Select a server from `registry` and record the attempt.
    ///
    /// The attempt is recorded before the registry lock is released, so a
    /// concurrent removal always forgets the server after its last selection.
    fn select(&self, registry: &ServerRegistry, context: &LoadBalancingContext) -> Result<Server> {
        let chosen = registry.with_healthy(|view| {
            let chosen = self
                .pick(view, context)
                .and_then(|index| view.server(index))
                .cloned();
            match &chosen {
                Some(server) => self.statistics().record_selection(server.id()),
                None => self.statistics().record_failed_selection(),
            }
            chosen
        });

        match chosen {
            Some(server) => {
                tracing::debug!(algorithm = self.name(), server = %server.id(), "Server selected");
                Ok(server)
            }
            None => {
                tracing::warn!(algorithm = self.name(), "No healthy servers available");
                Err(LoadBalancerError::NoHealthyServers)
            }
        }
    }
}

/// Available algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl AlgorithmKind {
    pub fn build(self) -> Box<dyn SelectionAlgorithm> {
        match self {
            AlgorithmKind::RoundRobin => Box::new(round_robin::RoundRobin::new()),
            AlgorithmKind::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        }
    }
}
