//! Server pool load balancing library.
//!
//! Keeps a pool of candidate servers, tracks their health from probe results
//! and request outcomes, and picks the server for each request with a
//! pluggable selection algorithm.

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;

pub use config::BalancerConfig;
pub use lifecycle::Shutdown;
pub use load_balancer::{LoadBalancerError, LoadBalancingContext, LoadBalancingEngine, Server, ServerStatus};
