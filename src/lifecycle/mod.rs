//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Ctrl-C / explicit trigger
//!     → shutdown.rs broadcasts once
//!     → health monitor loop exits
//!     → binary returns
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
