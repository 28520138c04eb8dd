//! Listeners and the gateway that runs them

pub mod config;
pub mod conn;
pub mod dial;
pub mod dns;
pub mod external_ip;
pub mod gateway;
pub mod handler;
pub mod proxy_protocol;
pub mod redirect;
pub mod router;
pub mod state_dir;
pub mod tsig;

// Re-export main server components
pub use config::EdgeConfig;
pub use dns::{DnsOptions, DnsServer};
pub use gateway::Gateway;
pub use redirect::RedirectFront;
pub use router::{Binding, RouterConfig, SniRouter};

#[cfg(test)]
mod router_tests;
