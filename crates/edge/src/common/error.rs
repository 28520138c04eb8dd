//! Error types for the network edge

use thiserror::Error;

/// Result type alias for edge operations
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Errors that can occur in the network edge
#[derive(Debug, Error)]
pub enum EdgeError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid SNI, hostname or hostname pattern
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or oversized PROXY protocol header
    #[error("PROXY protocol error: {0}")]
    ProxyProtocol(String),

    /// Protocol error (malformed ClientHello, unexpected peer behaviour)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// DNS wire format error
    #[error("DNS error: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    /// ACME protocol or transport error
    #[error("ACME error: {0}")]
    Acme(String),

    /// Key, CSR or certificate could not be generated or parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl EdgeError {
    /// True for errors that only mean the peer went away
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<instant_acme::Error> for EdgeError {
    fn from(e: instant_acme::Error) -> Self {
        Self::Acme(e.to_string())
    }
}

impl From<rcgen::Error> for EdgeError {
    fn from(e: rcgen::Error) -> Self {
        Self::Certificate(e.to_string())
    }
}

impl From<tokio_rustls::rustls::pki_types::pem::Error> for EdgeError {
    fn from(e: tokio_rustls::rustls::pki_types::pem::Error) -> Self {
        Self::Certificate(format!("PEM: {e}"))
    }
}
