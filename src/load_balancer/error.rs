//! Load balancing error definitions.

use std::fmt;

use thiserror::Error;

/// A single constraint a server record failed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigViolation {
    EmptyId,
    InvalidAddress(String),
    PortOutOfRange(u16),
    NonPositiveWeight(f64),
}

impl ConfigViolation {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigViolation::EmptyId => "id",
            ConfigViolation::InvalidAddress(_) => "address",
            ConfigViolation::PortOutOfRange(_) => "port",
            ConfigViolation::NonPositiveWeight(_) => "weight",
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigViolation::EmptyId => write!(f, "id must not be empty"),
            ConfigViolation::InvalidAddress(addr) => write!(f, "address {:?} is not a valid host", addr),
            ConfigViolation::PortOutOfRange(port) => write!(f, "port {} outside 1..=65535", port),
            ConfigViolation::NonPositiveWeight(w) => write!(f, "weight {} must be greater than zero", w),
        }
    }
}

fn join(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced by the registry, the algorithms and the engine.
///
/// All of them are recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadBalancerError {
    /// `add_server` with an id already in the pool.
    #[error("server {id:?} already exists")]
    DuplicateServer { id: String },

    /// The server record failed validation.
    #[error("invalid configuration for server {id:?}: {}", join(.violations))]
    InvalidServerConfiguration {
        id: String,
        violations: Vec<ConfigViolation>,
    },

    /// Operation referenced an id the pool does not know.
    #[error("server {id:?} not found")]
    ServerNotFound { id: String },

    /// Selection found an empty healthy subset.
    #[error("no healthy servers available")]
    NoHealthyServers,
}

impl LoadBalancerError {
    pub(crate) fn not_found(id: &str) -> Self {
        LoadBalancerError::ServerNotFound { id: id.to_string() }
    }
}

/// Result type for load balancing operations.
pub type Result<T> = std::result::Result<T, LoadBalancerError>;
