//! Self-hosted network edge
//!
//! - Server: SNI router, authoritative DNS, HTTP redirect front and the
//!   gateway that wires them together from configuration
//! - Client: ACME DNS-01 issuance and the certificate lifecycle manager

pub mod common;

pub mod client;

pub mod server;

// Re-export common types at crate root
pub use common::error;
pub use error::{EdgeError, Result};
