//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::load_balancer::registry::HealthyView;
use crate::load_balancer::server::LoadBalancingContext;
use crate::load_balancer::stats::Statistics;
use crate::load_balancer::SelectionAlgorithm;

const UNSET: u64 = u64::MAX;

/// Round-robin selector.
///
/// The cursor remembers the insertion sequence number of the server due next
/// rather than a bare index. When the subset changes, the cursor resolves to
/// that server's new position, or to its successor if it left the subset, so
/// churn neither skips a server nor restarts the rotation at the first one.
#[derive(Debug)]
pub struct RoundRobin {
    next: AtomicU64,
    stats: Statistics,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(UNSET),
            stats: Statistics::new("Round Robin"),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionAlgorithm for RoundRobin {
    fn name(&self) -> &'static str {
        "Round Robin"
    }

    // The load/store pair is serialised by the registry lock held around `pick`.
    fn pick(&self, healthy: &HealthyView<'_>, _context: &LoadBalancingContext) -> Option<usize> {
        let len = healthy.len();
        if len == 0 {
            return None;
        }

        let cursor = self.next.load(Ordering::Acquire);
        let index = if cursor == UNSET {
            0
        } else {
            match healthy.position(cursor) {
                Ok(i) => i,
                Err(i) if i < len => i,
                Err(_) => 0,
            }
        };

        let following = healthy.seq((index + 1) % len).unwrap_or(UNSET);
        self.next.store(following, Ordering::Release);
        Some(index)
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }
}
