//! Shared record types for connections and their outcomes

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the router knows about an accepted connection before reading from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Client address, replaced by the PROXY header source when one is present
    pub peer_addr: SocketAddr,
    /// Accepted on the internal listener; may reach internal-only patterns
    pub internal: bool,
}

impl ConnectionInfo {
    pub const fn public(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            internal: false,
        }
    }

    pub const fn internal(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            internal: true,
        }
    }
}

/// How a routed connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionOutcome {
    /// TLS terminated locally and handed to a handler
    Terminated,
    /// Spliced to a passthrough target
    Forwarded,
    /// Leading PROXY header could not be parsed
    ProxyHeaderInvalid,
    /// Passthrough target could not be reached
    DialFailed,
    /// No binding (or no certificate) for the announced name
    UnknownHostname,
    /// ClientHello unreadable or the TLS handshake did not complete
    HandshakeFailed,
}

impl ConnectionOutcome {
    /// Numeric code reported to dashboards
    pub const fn code(self) -> u16 {
        match self {
            Self::Terminated => 200,
            Self::Forwarded => 202,
            Self::ProxyHeaderInvalid => 400,
            Self::DialFailed => 502,
            Self::UnknownHostname => 666,
            Self::HandshakeFailed => 667,
        }
    }

    /// Whether the connection reached its destination
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Terminated | Self::Forwarded)
    }
}

impl fmt::Display for ConnectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminated => "terminated",
            Self::Forwarded => "forwarded",
            Self::ProxyHeaderInvalid => "proxy_header_invalid",
            Self::DialFailed => "dial_failed",
            Self::UnknownHostname => "unknown_hostname",
            Self::HandshakeFailed => "handshake_failed",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Record emitted once per connection after it terminates
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetric {
    pub timestamp: DateTime<Utc>,
    pub client_addr: SocketAddr,
    /// SNI, when one was read
    pub hostname: Option<String>,
    pub outcome: ConnectionOutcome,
    pub duration: Duration,
}
