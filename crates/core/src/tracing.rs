//! Shared tracing functionality for the edge services
//!
//! Metrics are kept in-process and exported on demand; log output goes
//! through `tracing-subscriber`.

pub mod config;
pub mod correlation;
pub mod init;
pub mod metrics;

#[cfg(feature = "tracing-prometheus")]
pub mod prometheus;

// Re-export commonly used types
pub use correlation::CorrelationId;
