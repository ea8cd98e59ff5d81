//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each server (bounded by timeout)
//!     → engine.update_server_metrics(snapshot)
//!
//! Passive health checks:
//!     Request outcome reported by caller
//!     → engine.report_outcome → same metrics path
//!
//! Evaluation (evaluator.rs):
//!     metrics + thresholds + now → Healthy | Unhealthy
//! ```
//!
//! # Design Decisions
//! - Active and passive signals share one metrics window
//! - The evaluator is pure; the registry owns the resulting transitions
//! - Time comes from a `Clock` so staleness is testable

pub mod active;
pub mod clock;
pub mod evaluator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use evaluator::{evaluate, HealthThresholds};
