//! Least Connections load balancing strategy.

use crate::load_balancer::registry::HealthyView;
use crate::load_balancer::server::LoadBalancingContext;
use crate::load_balancer::stats::Statistics;
use crate::load_balancer::SelectionAlgorithm;

/// Least connections selector.
/// Selects the healthy server with the fewest active connections.
#[derive(Debug)]
pub struct LeastConnections {
    stats: Statistics,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            stats: Statistics::new("Least Connections"),
        }
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionAlgorithm for LeastConnections {
    fn name(&self) -> &'static str {
        "Least Connections"
    }

    fn pick(&self, healthy: &HealthyView<'_>, _context: &LoadBalancingContext) -> Option<usize> {
        // min_by_key keeps the first minimum, so ties go to the oldest server.
        healthy
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, metrics))| metrics.active_connections)
            .map(|(index, _)| index)
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }
}
