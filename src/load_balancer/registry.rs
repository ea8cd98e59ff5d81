//! Server registry.
//!
//! # Responsibilities
//! - Own every server record and its live metrics
//! - Maintain the healthy subset incrementally, in insertion order
//! - Re-evaluate health on metrics updates and notify observers
//!
//! # Concurrency
//! One mutex guards the server map and the healthy subset. Algorithms run
//! inside that critical section (see [`ServerRegistry::with_healthy`]), so a
//! subset read and the indexed fetch that follows it always agree.
//!
//! # Observers
//! Hooks run in registration order, after the mutation has been committed and
//! the lock released. Events are queued under the lock and delivered in commit
//! order by one thread at a time: when another thread is already delivering,
//! it also delivers the events queued meanwhile, so a hook may run after the
//! call that caused it has returned. A hook must not call back into the
//! registry it observes. A panicking hook is logged and skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::health::clock::{Clock, SystemClock};
use crate::health::evaluator::{self, HealthThresholds};
use crate::load_balancer::error::{LoadBalancerError, Result};
use crate::load_balancer::server::{MetricsSnapshot, Server, ServerMetrics, ServerStatus};

/// Callbacks fired after registry mutations.
pub trait PoolObserver: Send + Sync {
    fn on_added(&self, _server: &Server) {}
    fn on_removed(&self, _server: &Server) {}
    fn on_status_changed(&self, _server: &Server, _old: ServerStatus, _new: ServerStatus) {}
    fn on_metrics_updated(&self, _server: &Server, _metrics: &ServerMetrics) {}
}

enum PoolEvent {
    Added(Server),
    Removed(Server),
    StatusChanged {
        server: Server,
        old: ServerStatus,
        new: ServerStatus,
    },
    MetricsUpdated {
        server: Server,
        metrics: ServerMetrics,
    },
}

struct Entry {
    /// Insertion sequence number; orders the healthy subset.
    seq: u64,
    server: Server,
    metrics: ServerMetrics,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    /// `(seq, id)` of selectable servers, sorted by `seq`.
    healthy: Vec<(u64, String)>,
    next_seq: u64,
}

impl PoolState {
    /// Change a server's status, keeping the healthy subset in step.
    /// Returns the previous status when it changed.
    fn set_status(&mut self, id: &str, new: ServerStatus, admit_unknown: bool) -> Option<ServerStatus> {
        let entry = self.entries.get_mut(id)?;
        let old = entry.server.status();
        if old == new {
            return None;
        }
        entry.server.set_status(new);
        let seq = entry.seq;

        let was = old.is_selectable(admit_unknown);
        let is = new.is_selectable(admit_unknown);
        match self.healthy.binary_search_by_key(&seq, |(s, _)| *s) {
            Ok(pos) if was && !is => {
                self.healthy.remove(pos);
            }
            Err(pos) if !was && is => {
                self.healthy.insert(pos, (seq, id.to_string()));
            }
            _ => {}
        }
        Some(old)
    }
}

/// Read-only view of the healthy subset, valid inside
/// [`ServerRegistry::with_healthy`].
pub struct HealthyView<'a> {
    healthy: &'a [(u64, String)],
    entries: &'a HashMap<String, Entry>,
}

impl<'a> HealthyView<'a> {
    pub fn len(&self) -> usize {
        self.healthy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.healthy.is_empty()
    }

    fn entry(&self, index: usize) -> Option<&'a Entry> {
        let (_, id) = self.healthy.get(index)?;
        self.entries.get(id)
    }

    pub fn server(&self, index: usize) -> Option<&'a Server> {
        self.entry(index).map(|e| &e.server)
    }

    pub fn metrics(&self, index: usize) -> Option<&'a ServerMetrics> {
        self.entry(index).map(|e| &e.metrics)
    }

    /// Insertion sequence number of the server at `index`.
    pub fn seq(&self, index: usize) -> Option<u64> {
        self.healthy.get(index).map(|(seq, _)| *seq)
    }

    /// Position of `seq` in the subset, or where it would sit if present.
    pub fn position(&self, seq: u64) -> std::result::Result<usize, usize> {
        self.healthy.binary_search_by_key(&seq, |(s, _)| *s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a Server, &'a ServerMetrics)> + '_ {
        (0..self.len()).filter_map(move |i| self.entry(i).map(|e| (&e.server, &e.metrics)))
    }
}

/// Thread-safe pool of servers.
pub struct ServerRegistry {
    state: Mutex<PoolState>,
    thresholds: HealthThresholds,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn PoolObserver>>,
    /// Committed events not yet delivered, in commit order.
    pending: Mutex<VecDeque<PoolEvent>>,
    /// Held by whichever thread is currently delivering `pending`.
    delivering: Mutex<()>,
}

impl ServerRegistry {
    /// Create an empty registry on the system clock.
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self::with_clock(thresholds, Arc::new(SystemClock))
    }

    pub fn with_clock(thresholds: HealthThresholds, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            thresholds,
            clock,
            observers: Vec::new(),
            pending: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
        }
    }

    /// Register an observer. Observers fire in the order they were added.
    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every mutation is complete before a panic can occur, so the state
        // behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new server. It starts `Unknown` with zeroed metrics.
    pub fn add_server(&self, mut server: Server) -> Result<()> {
        let mut state = self.lock();
        if state.entries.contains_key(server.id()) {
            return Err(LoadBalancerError::DuplicateServer {
                id: server.id().to_string(),
            });
        }
        let violations = server.violations();
        if !violations.is_empty() {
            return Err(LoadBalancerError::InvalidServerConfiguration {
                id: server.id().to_string(),
                violations,
            });
        }

        server.set_status(ServerStatus::Unknown);
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = server.id().to_string();
        if ServerStatus::Unknown.is_selectable(self.thresholds.admit_unknown) {
            // Newest seq always sorts last.
            state.healthy.push((seq, id.clone()));
        }
        let metrics = ServerMetrics::new(self.clock.now(), self.thresholds.window);
        state.entries.insert(
            id,
            Entry {
                seq,
                server: server.clone(),
                metrics,
            },
        );

        tracing::info!(server = %server.id(), endpoint = %server.endpoint(), "Server added to pool");
        self.publish(state, vec![PoolEvent::Added(server)]);
        Ok(())
    }

    /// Remove a server and return its last record.
    pub fn remove_server(&self, server_id: &str) -> Result<Server> {
        self.remove_server_with(server_id, |_| {})
    }

    /// Remove a server, running `on_removed` before the registry lock is released.
    pub(crate) fn remove_server_with(&self, server_id: &str, on_removed: impl FnOnce(&Server)) -> Result<Server> {
        let mut state = self.lock();
        let entry = state
            .entries
            .remove(server_id)
            .ok_or_else(|| LoadBalancerError::not_found(server_id))?;
        if let Ok(pos) = state.healthy.binary_search_by_key(&entry.seq, |(s, _)| *s) {
            state.healthy.remove(pos);
        }
        on_removed(&entry.server);

        tracing::info!(server = %server_id, "Server removed from pool");
        self.publish(state, vec![PoolEvent::Removed(entry.server.clone())]);
        Ok(entry.server)
    }

    pub fn get_server(&self, server_id: &str) -> Result<Server> {
        self.lock()
            .entries
            .get(server_id)
            .map(|e| e.server.clone())
            .ok_or_else(|| LoadBalancerError::not_found(server_id))
    }

    pub fn get_metrics(&self, server_id: &str) -> Result<ServerMetrics> {
        self.lock()
            .entries
            .get(server_id)
            .map(|e| e.metrics.clone())
            .ok_or_else(|| LoadBalancerError::not_found(server_id))
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.lock().entries.contains_key(server_id)
    }

    /// The healthy subset in insertion order.
    pub fn get_healthy_servers(&self) -> Vec<Server> {
        self.with_healthy(|view| view.iter().map(|(s, _)| s.clone()).collect())
    }

    /// Every server in insertion order.
    pub fn servers(&self) -> Vec<Server> {
        let state = self.lock();
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.server.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn healthy_len(&self) -> usize {
        self.lock().healthy.len()
    }

    /// Run `f` against the healthy subset while holding the registry lock.
    pub fn with_healthy<R>(&self, f: impl FnOnce(&HealthyView<'_>) -> R) -> R {
        let state = self.lock();
        let view = HealthyView {
            healthy: &state.healthy,
            entries: &state.entries,
        };
        f(&view)
    }

    /// Run `f` with the pool size and healthy count, under the registry lock.
    pub(crate) fn with_counts<R>(&self, f: impl FnOnce(usize, usize) -> R) -> R {
        let state = self.lock();
        f(state.entries.len(), state.healthy.len())
    }

    /// Merge a snapshot, re-evaluate health and return the resulting status.
    ///
    /// Servers in `Maintenance` keep their status.
    pub fn update_server_metrics(&self, server_id: &str, snapshot: &MetricsSnapshot) -> Result<ServerStatus> {
        self.update_server_metrics_with(server_id, snapshot, |_| {})
    }

    /// As [`Self::update_server_metrics`], running `on_recorded` before the
    /// registry lock is released.
    pub(crate) fn update_server_metrics_with(
        &self,
        server_id: &str,
        snapshot: &MetricsSnapshot,
        on_recorded: impl FnOnce(&Server),
    ) -> Result<ServerStatus> {
        let now = self.clock.now();
        let mut events = Vec::with_capacity(2);
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(server_id)
            .ok_or_else(|| LoadBalancerError::not_found(server_id))?;
        entry.metrics.record(snapshot, now);
        on_recorded(&entry.server);

        let current = entry.server.status();
        let derived = if current == ServerStatus::Maintenance {
            current
        } else {
            evaluator::evaluate(&entry.metrics, &self.thresholds, now)
        };
        events.push(PoolEvent::MetricsUpdated {
            server: entry.server.clone(),
            metrics: entry.metrics.clone(),
        });

        if let Some(old) = state.set_status(server_id, derived, self.thresholds.admit_unknown) {
            if let Some(entry) = state.entries.get(server_id) {
                events.push(PoolEvent::StatusChanged {
                    server: entry.server.clone(),
                    old,
                    new: derived,
                });
            }
        }

        self.publish(state, events);
        Ok(derived)
    }

    /// Administrative status override.
    pub fn update_server_status(&self, server_id: &str, status: ServerStatus) -> Result<()> {
        let mut state = self.lock();
        if !state.entries.contains_key(server_id) {
            return Err(LoadBalancerError::not_found(server_id));
        }
        let event = state
            .set_status(server_id, status, self.thresholds.admit_unknown)
            .and_then(|old| {
                state.entries.get(server_id).map(|e| PoolEvent::StatusChanged {
                    server: e.server.clone(),
                    old,
                    new: status,
                })
            });

        self.publish(state, event.into_iter().collect());
        Ok(())
    }

    /// Mark every server whose metrics went stale as unhealthy.
    ///
    /// Only demotes: servers still waiting for their first probe are not
    /// promoted here. Returns the number of servers that changed.
    pub fn evaluate_staleness(&self) -> usize {
        self.evaluate_staleness_except(&HashSet::new())
    }

    /// As [`Self::evaluate_staleness`], leaving the servers in `skip` alone.
    pub fn evaluate_staleness_except(&self, skip: &HashSet<String>) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let stale: Vec<String> = state
            .entries
            .values()
            .filter(|e| {
                matches!(e.server.status(), ServerStatus::Healthy | ServerStatus::Unknown)
                    && !skip.contains(e.server.id())
                    && e.metrics.is_stale_at(now, self.thresholds.stale_after)
            })
            .map(|e| e.server.id().to_string())
            .collect();

        let events: Vec<PoolEvent> = stale
            .into_iter()
            .filter_map(|id| {
                let old = state.set_status(&id, ServerStatus::Unhealthy, self.thresholds.admit_unknown)?;
                let server = state.entries.get(&id)?.server.clone();
                Some(PoolEvent::StatusChanged {
                    server,
                    old,
                    new: ServerStatus::Unhealthy,
                })
            })
            .collect();

        let changed = events.len();
        self.publish(state, events);
        changed
    }

    /// Zero every server's request counters. Identity, status and
    /// membership are untouched.
    pub fn reset_statistics(&self) {
        self.reset_statistics_with(|| {});
    }

    /// As [`Self::reset_statistics`], running `also` under the same lock.
    pub(crate) fn reset_statistics_with(&self, also: impl FnOnce()) {
        let mut state = self.lock();
        for entry in state.entries.values_mut() {
            entry.metrics.reset_counters();
        }
        also();
    }

    pub fn connection_opened(&self, server_id: &str) -> Result<u32> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(server_id)
            .ok_or_else(|| LoadBalancerError::not_found(server_id))?;
        entry.metrics.active_connections = entry.metrics.active_connections.saturating_add(1);
        Ok(entry.metrics.active_connections)
    }

    pub fn connection_closed(&self, server_id: &str) -> Result<u32> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(server_id)
            .ok_or_else(|| LoadBalancerError::not_found(server_id))?;
        entry.metrics.active_connections = entry.metrics.active_connections.saturating_sub(1);
        Ok(entry.metrics.active_connections)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PoolEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `events` while the state lock is still held, so the queue order
    /// is the commit order, then release the lock and deliver.
    fn publish(&self, state: MutexGuard<'_, PoolState>, events: Vec<PoolEvent>) {
        if events.is_empty() {
            return;
        }
        self.pending().extend(events);
        drop(state);
        self.deliver();
    }

    /// Drain the queue unless another thread already is. That thread picks up
    /// anything queued before it lets go.
    fn deliver(&self) {
        loop {
            let turn = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let next = self.pending().pop_front();
                match next {
                    Some(event) => self.notify(&event),
                    None => break,
                }
            }
            drop(turn);
            if self.pending().is_empty() {
                return;
            }
        }
    }

    fn notify(&self, event: &PoolEvent) {
        if let PoolEvent::StatusChanged { server, old, new } = event {
            tracing::info!(server = %server.id(), from = %old, to = %new, "Server status changed");
        }
        for observer in &self.observers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
                PoolEvent::Added(server) => observer.on_added(server),
                PoolEvent::Removed(server) => observer.on_removed(server),
                PoolEvent::StatusChanged { server, old, new } => {
                    observer.on_status_changed(server, *old, *new)
                }
                PoolEvent::MetricsUpdated { server, metrics } => {
                    observer.on_metrics_updated(server, metrics)
                }
            }));
            if outcome.is_err() {
                tracing::warn!("Pool observer panicked; mutation already committed");
            }
        }
    }
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ServerRegistry")
            .field("servers", &state.entries.len())
            .field("healthy", &state.healthy.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
