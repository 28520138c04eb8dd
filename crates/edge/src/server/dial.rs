//! Passthrough dialers

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::common::error::{EdgeError, Result};
use crate::common::types::ConnectionInfo;
use crate::server::conn::BoxedIo;
use crate::server::proxy_protocol::ProxyHeader;

/// Opens the backend connection for a passthrough binding
///
/// The returned stream receives the client's raw TLS bytes, starting with
/// the replayed ClientHello.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, sni: &str, info: &ConnectionInfo) -> Result<BoxedIo>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// Dials a fixed TCP address, optionally announcing the client with PROXY v1
#[derive(Debug, Clone)]
pub struct TcpDialer {
    target: String,
    proxy_protocol: bool,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            proxy_protocol: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, sni: &str, info: &ConnectionInfo) -> Result<BoxedIo> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.target))
            .await
            .map_err(|_| EdgeError::Timeout(format!("connecting to {}", self.target)))??;
        stream.set_nodelay(true)?;

        if self.proxy_protocol {
            let header = ProxyHeader::for_connection(info.peer_addr, stream.peer_addr()?);
            debug!("Sending PROXY header for {} to {}", sni, self.target);
            stream.write_all(header.encode().as_bytes()).await?;
        }

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        if self.proxy_protocol {
            format!("tcp://{} (proxy protocol)", self.target)
        } else {
            format!("tcp://{}", self.target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_writes_proxy_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let dialer = TcpDialer::new(target.to_string()).with_proxy_protocol(true);
        let info = ConnectionInfo::public("192.0.2.10:40000".parse().unwrap());

        let accept = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 128];
            let n = conn.read(&mut buf).await.unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        let _conn = dialer.dial("a.example.com", &info).await.unwrap();
        let header = accept.await.unwrap();
        assert_eq!(
            header,
            format!("PROXY TCP4 192.0.2.10 127.0.0.1 40000 {}\r\n", target.port())
        );
    }

    #[tokio::test]
    async fn test_tcp_dialer_reports_unreachable_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(target.to_string());
        let info = ConnectionInfo::public("192.0.2.10:40000".parse().unwrap());
        assert!(dialer.dial("a.example.com", &info).await.is_err());
    }
}
