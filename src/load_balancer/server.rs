//! Server abstraction.
//!
//! # Responsibilities
//! - Represent a single candidate server and its static attributes
//! - Track rolling per-server metrics (outcomes, latency, connections)
//! - Carry the per-request context handed to selection algorithms
//!
//! Records returned by the registry are copies; the registry's own entry is
//! the only mutable instance.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::load_balancer::error::ConfigViolation;

/// Weight applied to the newest latency sample in the moving average.
const LATENCY_SMOOTHING: f64 = 0.3;

/// Health status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No probe result recorded yet.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// Administratively drained. Only an explicit status update leaves it.
    Maintenance,
}

impl ServerStatus {
    /// Whether a server in this status belongs to the healthy subset.
    pub fn is_selectable(self, admit_unknown: bool) -> bool {
        match self {
            ServerStatus::Healthy => true,
            ServerStatus::Unknown => admit_unknown,
            ServerStatus::Unhealthy | ServerStatus::Maintenance => false,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Healthy => "healthy",
            ServerStatus::Unhealthy => "unhealthy",
            ServerStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// A single backend server in the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    id: String,
    /// Host name or IP address.
    pub address: String,
    pub port: u16,
    /// Relative capacity, reserved for weighted algorithms.
    pub weight: f64,
    /// Free-form labels (zone, version, ...).
    pub metadata: HashMap<String, String>,
    status: ServerStatus,
}

impl Server {
    /// Create a server with weight 1.0 and no metadata.
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            weight: 1.0,
            metadata: HashMap::new(),
            status: ServerStatus::Unknown,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
    }

    /// `address:port`, bracketing bare IPv6 literals.
    pub fn endpoint(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    /// True only for servers a probe has confirmed healthy.
    pub fn is_available(&self) -> bool {
        self.status == ServerStatus::Healthy
    }

    /// Every constraint this record violates, in field order.
    pub fn violations(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();
        if self.id.trim().is_empty() {
            violations.push(ConfigViolation::EmptyId);
        }
        if !is_valid_address(&self.address) {
            violations.push(ConfigViolation::InvalidAddress(self.address.clone()));
        }
        if self.port == 0 {
            violations.push(ConfigViolation::PortOutOfRange(self.port));
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            violations.push(ConfigViolation::NonPositiveWeight(self.weight));
        }
        violations
    }
}

fn is_valid_address(address: &str) -> bool {
    if address.parse::<IpAddr>().is_ok() {
        return true;
    }
    !address.is_empty() && url::Host::parse(address).is_ok()
}

/// One observation pushed by a prober or reported by a caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub success: bool,
    pub latency: Duration,
    pub observed_at: SystemTime,
    /// Connection count reported by the observer, if it knows one.
    pub active_connections: Option<u32>,
}

impl MetricsSnapshot {
    pub fn success(latency: Duration, observed_at: SystemTime) -> Self {
        Self {
            success: true,
            latency,
            observed_at,
            active_connections: None,
        }
    }

    pub fn failure(latency: Duration, observed_at: SystemTime) -> Self {
        Self {
            success: false,
            latency,
            observed_at,
            active_connections: None,
        }
    }
}

/// Rolling metrics for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponentially weighted moving average of observed latency.
    pub latency: Option<Duration>,
    pub active_connections: u32,
    /// Never moves backwards and never past the clock.
    pub last_updated: SystemTime,
    #[serde(skip)]
    recent: VecDeque<bool>,
    #[serde(skip)]
    window: usize,
}

impl ServerMetrics {
    /// Zeroed metrics stamped at `now`, keeping the last `window` outcomes.
    pub fn new(now: SystemTime, window: usize) -> Self {
        let window = window.max(1);
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            latency: None,
            active_connections: 0,
            last_updated: now,
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Stale against the wall clock.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.is_stale_at(SystemTime::now(), threshold)
    }

    pub fn is_stale_at(&self, now: SystemTime, threshold: Duration) -> bool {
        now.duration_since(self.last_updated)
            .map(|age| age > threshold)
            .unwrap_or(false)
    }

    /// Failed share of the recent window, `None` before any outcome.
    pub fn failure_ratio(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / self.recent.len() as f64)
    }

    /// Number of outcomes currently in the window.
    pub fn recent_samples(&self) -> usize {
        self.recent.len()
    }

    /// Merge a snapshot observed no later than `now`.
    pub fn record(&mut self, snapshot: &MetricsSnapshot, now: SystemTime) {
        self.total_requests += 1;
        if snapshot.success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        self.latency = Some(match self.latency {
            Some(avg) => {
                avg.mul_f64(1.0 - LATENCY_SMOOTHING) + snapshot.latency.mul_f64(LATENCY_SMOOTHING)
            }
            None => snapshot.latency,
        });

        if let Some(connections) = snapshot.active_connections {
            self.active_connections = connections;
        }

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(snapshot.success);

        let observed = snapshot.observed_at.min(now);
        if observed > self.last_updated {
            self.last_updated = observed;
        }
    }

    /// Clear request counters and the outcome window.
    pub fn reset_counters(&mut self) {
        self.total_requests = 0;
        self.successful_requests = 0;
        self.failed_requests = 0;
        self.recent.clear();
    }
}

/// Immutable per-request input to selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancingContext {
    client_addr: Option<IpAddr>,
    path: Option<String>,
    method: Option<String>,
    headers: HashMap<String, String>,
    /// Server that handled the previous attempt of this request.
    previous_server: Option<String>,
    retry_count: u32,
    metadata: HashMap<String, String>,
    timestamp: SystemTime,
}

impl LoadBalancingContext {
    pub fn new(client_addr: Option<IpAddr>) -> Self {
        Self {
            client_addr,
            path: None,
            method: None,
            headers: HashMap::new(),
            previous_server: None,
            retry_count: 0,
            metadata: HashMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Context for callers with no request details.
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn with_request(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.path = Some(path.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Mark this as a retry after `server_id` failed. Each call counts one retry.
    pub fn retried_from(mut self, server_id: impl Into<String>) -> Self {
        self.previous_server = Some(server_id.into());
        self.retry_count = self.retry_count.saturating_add(1);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Header lookup, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn previous_server(&self) -> Option<&str> {
        self.previous_server.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl Default for LoadBalancingContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_reports_every_violation() {
        let server = Server::new("", "", 0).with_weight(-1.0);
        let violations = server.violations();
        assert_eq!(violations.len(), 4);
        assert_eq!(violations[0], ConfigViolation::EmptyId);
        assert_eq!(violations[2], ConfigViolation::PortOutOfRange(0));

        assert!(Server::new("a", "192.168.1.1", 8080).violations().is_empty());
        assert!(Server::new("b", "backend.internal", 1).violations().is_empty());
        assert!(Server::new("c", "::1", 65535).violations().is_empty());
        assert!(!Server::new("d", "bad host", 80).violations().is_empty());
        assert!(!Server::new("e", "10.0.0.1", 80).with_weight(f64::NAN).violations().is_empty());
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(Server::new("a", "10.0.0.1", 80).endpoint(), "10.0.0.1:80");
        assert_eq!(Server::new("b", "::1", 443).endpoint(), "[::1]:443");
    }

    #[test]
    fn test_is_stale_with_custom_threshold() {
        let now = SystemTime::now();
        let metrics = ServerMetrics::new(now - Duration::from_secs(10), 4);
        assert!(!metrics.is_stale_at(now, Duration::from_secs(30)));
        assert!(metrics.is_stale_at(now, Duration::from_secs(5)));

        let old = ServerMetrics::new(now - Duration::from_secs(3600), 4);
        assert!(old.is_stale(Duration::from_secs(30)));
    }

    #[test]
    fn test_record_keeps_timestamp_monotonic() {
        let start = SystemTime::now();
        let mut metrics = ServerMetrics::new(start, 4);

        let older = MetricsSnapshot::success(Duration::from_millis(5), start - Duration::from_secs(60));
        metrics.record(&older, start);
        assert_eq!(metrics.last_updated, start);

        let future = MetricsSnapshot::success(Duration::from_millis(5), start + Duration::from_secs(60));
        let now = start + Duration::from_secs(1);
        metrics.record(&future, now);
        assert_eq!(metrics.last_updated, now);
    }

    #[test]
    fn test_failure_ratio_uses_window() {
        let now = SystemTime::now();
        let mut metrics = ServerMetrics::new(now, 2);
        assert_eq!(metrics.failure_ratio(), None);

        metrics.record(&MetricsSnapshot::failure(Duration::ZERO, now), now);
        metrics.record(&MetricsSnapshot::failure(Duration::ZERO, now), now);
        assert_eq!(metrics.failure_ratio(), Some(1.0));

        metrics.record(&MetricsSnapshot::success(Duration::ZERO, now), now);
        assert_eq!(metrics.failure_ratio(), Some(0.5));
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 2);

        metrics.reset_counters();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.failure_ratio(), None);
    }

    #[test]
    fn test_latency_moving_average() {
        let now = SystemTime::now();
        let mut metrics = ServerMetrics::new(now, 4);
        metrics.record(&MetricsSnapshot::success(Duration::from_millis(100), now), now);
        assert_eq!(metrics.latency, Some(Duration::from_millis(100)));

        metrics.record(&MetricsSnapshot::success(Duration::from_millis(200), now), now);
        let avg = metrics.latency.unwrap();
        assert!(avg > Duration::from_millis(120) && avg < Duration::from_millis(140));
    }

    #[test]
    fn test_unknown_admission() {
        assert!(ServerStatus::Unknown.is_selectable(true));
        assert!(!ServerStatus::Unknown.is_selectable(false));
        assert!(!ServerStatus::Maintenance.is_selectable(true));
    }

    #[test]
    fn test_context_carries_retry_and_headers() {
        let ctx = LoadBalancingContext::new("10.1.1.1".parse().ok())
            .with_request("GET", "/api")
            .with_header("X-Session", "abc")
            .with_metadata("tenant", "t1");
        assert_eq!(ctx.retry_count(), 0);
        assert_eq!(ctx.previous_server(), None);
        assert_eq!(ctx.header("x-session"), Some("abc"));
        assert_eq!(ctx.metadata().get("tenant").map(String::as_str), Some("t1"));

        let retry = ctx.clone().retried_from("s1").retried_from("s2");
        assert_eq!(retry.previous_server(), Some("s2"));
        assert_eq!(retry.retry_count(), 2);
        assert_eq!(retry.path(), Some("/api"));
        assert_eq!(retry.header("X-SESSION"), Some("abc"));
    }
}
