//! Metrics collection and exposition.
//!
//! # Metrics
//! - `balancer_selections_total` (counter): successful selections by server
//! - `balancer_selection_failures_total` (counter): selections with no healthy server
//! - `balancer_outcomes_total` (counter): reported outcomes by server, result
//! - `balancer_server_health` (gauge): 1=selectable, 0=not
//! - `balancer_pool_size` (gauge): servers in the pool
//! - `balancer_probe_duration_seconds` (histogram): active probe latency
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::load_balancer::registry::PoolObserver;
use crate::load_balancer::server::{Server, ServerStatus};

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_selection(server: &str) {
    ::metrics::counter!("balancer_selections_total", "server" => server.to_string()).increment(1);
}

pub fn record_selection_failure() {
    ::metrics::counter!("balancer_selection_failures_total").increment(1);
}

pub fn record_outcome(server: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    ::metrics::counter!("balancer_outcomes_total", "server" => server.to_string(), "result" => result)
        .increment(1);
}

pub fn record_server_health(server: &str, healthy: bool) {
    ::metrics::gauge!("balancer_server_health", "server" => server.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_probe(server: &str, elapsed: Duration) {
    ::metrics::histogram!("balancer_probe_duration_seconds", "server" => server.to_string())
        .record(elapsed.as_secs_f64());
}

/// Publishes pool membership and health as gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver {
    admit_unknown: bool,
}

impl MetricsObserver {
    pub fn new(admit_unknown: bool) -> Self {
        Self { admit_unknown }
    }
}

impl PoolObserver for MetricsObserver {
    fn on_added(&self, server: &Server) {
        ::metrics::gauge!("balancer_pool_size").increment(1.0);
        record_server_health(server.id(), server.status().is_selectable(self.admit_unknown));
    }

    fn on_removed(&self, server: &Server) {
        ::metrics::gauge!("balancer_pool_size").decrement(1.0);
        record_server_health(server.id(), false);
    }

    fn on_status_changed(&self, server: &Server, _old: ServerStatus, new: ServerStatus) {
        record_server_health(server.id(), new.is_selectable(self.admit_unknown));
    }
}
