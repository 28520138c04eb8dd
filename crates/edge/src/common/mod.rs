//! Types shared by the server and client halves of the edge

pub mod error;
pub mod hostname;
pub mod types;

pub use error::{EdgeError, Result};
pub use hostname::HostnamePattern;
pub use types::{ConnectionInfo, ConnectionMetric, ConnectionOutcome};
