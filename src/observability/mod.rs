//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! registry / algorithms / prober produce:
//!     → tracing events (logging.rs installs the subscriber)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout log lines
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (server id, status) on every event
//! - Metrics are cheap and no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
