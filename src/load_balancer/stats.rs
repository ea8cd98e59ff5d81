//! Selection and outcome statistics.
//!
//! Counters are atomics behind a read-write lock: increments share the read
//! side, while `reset` and `snapshot` serialise on the lock so a reader never
//! observes a half-reset table. The engine updates it while holding the registry
//! lock; this lock never takes the registry's, so the order is fixed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::SystemTime;

use serde::Serialize;

use crate::observability::metrics;

#[derive(Debug, Default)]
struct ServerCounters {
    selected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl ServerCounters {
    fn load(&self) -> ServerStatistics {
        ServerStatistics {
            selected: self.selected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn zero(&self) {
        self.selected.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Table {
    servers: HashMap<String, ServerCounters>,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
    last_reset: SystemTime,
}

/// Counters for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatistics {
    pub selected: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub algorithm: String,
    /// Successful selections.
    pub total_selections: u64,
    /// Selections that found no healthy server.
    pub failed_selections: u64,
    pub server_count: usize,
    pub healthy_server_count: usize,
    pub servers: BTreeMap<String, ServerStatistics>,
    pub last_reset: SystemTime,
}

impl StatisticsSnapshot {
    /// Selection attempts, successful or not.
    pub fn total_requests(&self) -> u64 {
        self.total_selections + self.failed_selections
    }

    pub fn server(&self, id: &str) -> ServerStatistics {
        self.servers.get(id).copied().unwrap_or_default()
    }
}

/// Statistics tracker owned by a selection algorithm.
#[derive(Debug)]
pub struct Statistics {
    algorithm: &'static str,
    table: RwLock<Table>,
}

impl Statistics {
    pub fn new(algorithm: &'static str) -> Self {
        Self {
            algorithm,
            table: RwLock::new(Table {
                servers: HashMap::new(),
                total_selections: AtomicU64::new(0),
                failed_selections: AtomicU64::new(0),
                last_reset: SystemTime::now(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a server's counters, creating them on first use.
    fn with_server(&self, server_id: &str, f: impl Fn(&Table, &ServerCounters)) {
        {
            let table = self.read();
            if let Some(counters) = table.servers.get(server_id) {
                f(&*table, counters);
                return;
            }
        }
        let mut guard = self.write();
        guard.servers.entry(server_id.to_string()).or_default();
        let table = &*guard;
        if let Some(counters) = table.servers.get(server_id) {
            f(table, counters);
        }
    }

    pub fn record_selection(&self, server_id: &str) {
        self.with_server(server_id, |table, c| {
            c.selected.fetch_add(1, Ordering::Relaxed);
            table.total_selections.fetch_add(1, Ordering::Relaxed);
        });
        metrics::record_selection(server_id);
    }

    /// A selection attempt that found nothing; not attributed to any server.
    pub fn record_failed_selection(&self) {
        self.read().failed_selections.fetch_add(1, Ordering::Relaxed);
        metrics::record_selection_failure();
    }

    pub fn record_outcome(&self, server_id: &str, success: bool) {
        self.with_server(server_id, |_, c| {
            if success {
                c.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                c.failed.fetch_add(1, Ordering::Relaxed);
            }
        });
        metrics::record_outcome(server_id, success);
    }

    /// Drop a removed server's counters.
    pub fn forget(&self, server_id: &str) {
        self.write().servers.remove(server_id);
    }

    pub fn server(&self, server_id: &str) -> ServerStatistics {
        self.read()
            .servers
            .get(server_id)
            .map(ServerCounters::load)
            .unwrap_or_default()
    }

    /// Zero every counter in one step.
    pub fn reset(&self) {
        let mut table = self.write();
        for counters in table.servers.values() {
            counters.zero();
        }
        table.total_selections.store(0, Ordering::Relaxed);
        table.failed_selections.store(0, Ordering::Relaxed);
        table.last_reset = SystemTime::now();
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let table = self.write();
        StatisticsSnapshot {
            algorithm: self.algorithm.to_string(),
            total_selections: table.total_selections.load(Ordering::Relaxed),
            failed_selections: table.failed_selections.load(Ordering::Relaxed),
            server_count: 0,
            healthy_server_count: 0,
            servers: table
                .servers
                .iter()
                .map(|(id, c)| (id.clone(), c.load()))
                .collect(),
            last_reset: table.last_reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_selection_and_outcome_are_separate() {
        let stats = Statistics::new("Round Robin");
        stats.record_selection("a");
        stats.record_selection("a");
        stats.record_outcome("a", true);
        stats.record_outcome("b", false);
        stats.record_failed_selection();

        let snap = stats.snapshot();
        assert_eq!(snap.algorithm, "Round Robin");
        assert_eq!(snap.total_selections, 2);
        assert_eq!(snap.failed_selections, 1);
        assert_eq!(snap.total_requests(), 3);
        assert_eq!(snap.server("a"), ServerStatistics { selected: 2, succeeded: 1, failed: 0 });
        assert_eq!(snap.server("b"), ServerStatistics { selected: 0, succeeded: 0, failed: 1 });
        assert_eq!(snap.server("missing"), ServerStatistics::default());
    }

    #[test]
    fn test_reset_and_forget() {
        let stats = Statistics::new("Round Robin");
        stats.record_selection("a");
        stats.record_selection("b");
        stats.record_failed_selection();
        let before = stats.snapshot().last_reset;

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests(), 0);
        assert_eq!(snap.server("a"), ServerStatistics::default());
        assert!(snap.servers.contains_key("a"));
        assert!(snap.last_reset >= before);

        stats.forget("a");
        assert!(!stats.snapshot().servers.contains_key("a"));
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(Statistics::new("Round Robin"));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_selection(if t % 2 == 0 { "a" } else { "b" });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.total_selections, 1000);
        assert_eq!(snap.server("a").selected, 500);
        assert_eq!(snap.server("b").selected, 500);
    }
}
