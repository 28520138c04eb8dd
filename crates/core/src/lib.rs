//! Shared utilities for the edge workspace: instrumentation and configuration validation

#[cfg(feature = "tracing")]
pub mod tracing;
pub mod validation;

pub use validation::{ValidateConfig, validators};
