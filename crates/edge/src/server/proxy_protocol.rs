//! PROXY protocol v1 (text form)
//!
//! Inbound: an optional `PROXY ...\r\n` line in front of the TLS stream
//! replaces the observed peer address. Outbound: passthrough dials can emit
//! the same line so the backend learns the real client address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::error::{EdgeError, Result};
use crate::server::conn::ConnWrapper;

/// Longest legal v1 header, CRLF included
pub const MAX_HEADER_LEN: usize = 107;

const SIGNATURE: &[u8] = b"PROXY ";

/// A parsed PROXY v1 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeader {
    /// `TCP4` or `TCP6`, chosen by the address family
    Inet {
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// `PROXY UNKNOWN`: the sender could not tell; keep the socket address
    Unknown,
}

impl ProxyHeader {
    /// Header describing a client connection forwarded to `target`
    ///
    /// The family follows the client. A v4 client in front of a v6 target is
    /// expressed as a `TCP6` line with the client address v4-mapped.
    pub fn for_connection(client: SocketAddr, target: SocketAddr) -> Self {
        let (source, destination) = match (client.ip(), target.ip()) {
            (IpAddr::V4(c), IpAddr::V6(_)) => (
                SocketAddr::new(IpAddr::V6(c.to_ipv6_mapped()), client.port()),
                target,
            ),
            (IpAddr::V6(_), IpAddr::V4(t)) => (
                client,
                SocketAddr::new(IpAddr::V6(t.to_ipv6_mapped()), target.port()),
            ),
            _ => (client, target),
        };
        Self::Inet {
            source,
            destination,
        }
    }

    /// Parse one header line; the trailing CRLF is optional here
    pub fn parse(line: &str) -> Result<Self> {
        let malformed = || EdgeError::ProxyProtocol(format!("malformed header {line:?}"));

        let line = line.strip_suffix("\r\n").unwrap_or(line);
        let rest = line.strip_prefix("PROXY ").ok_or_else(malformed)?;
        let mut fields = rest.split(' ');

        let proto = fields.next().ok_or_else(malformed)?;
        if proto == "UNKNOWN" {
            return Ok(Self::Unknown);
        }

        let src_ip: IpAddr = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let dst_ip: IpAddr = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let src_port: u16 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let dst_port: u16 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        if fields.next().is_some() {
            return Err(malformed());
        }

        let family_ok = match proto {
            "TCP4" => src_ip.is_ipv4() && dst_ip.is_ipv4(),
            "TCP6" => src_ip.is_ipv6() && dst_ip.is_ipv6(),
            _ => false,
        };
        if !family_ok {
            return Err(malformed());
        }

        Ok(Self::Inet {
            source: SocketAddr::new(src_ip, src_port),
            destination: SocketAddr::new(dst_ip, dst_port),
        })
    }

    /// The header line, CRLF included
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Client address carried by the header, if any
    pub fn source(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet { source, .. } => Some(*source),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ProxyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet {
                source,
                destination,
            } => {
                let proto = if source.is_ipv4() { "TCP4" } else { "TCP6" };
                write!(
                    f,
                    "PROXY {proto} {} {} {} {}\r\n",
                    source.ip(),
                    destination.ip(),
                    source.port(),
                    destination.port()
                )
            }
            Self::Unknown => f.write_str("PROXY UNKNOWN\r\n"),
        }
    }
}

/// Read an optional PROXY header from the front of a connection
///
/// Returns `Ok(None)` and leaves the stream untouched when it does not start
/// with the v1 signature. Bytes read past the header are pushed back.
pub async fn read_proxy_header<S>(conn: &mut ConnWrapper<S>) -> Result<Option<ProxyHeader>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN);
    let mut chunk = [0u8; MAX_HEADER_LEN];

    loop {
        let checked = buf.len().min(SIGNATURE.len());
        if buf[..checked] != SIGNATURE[..checked] {
            conn.unread(buf.freeze());
            return Ok(None);
        }

        if let Some(end) = find_crlf(&buf) {
            let rest = buf.split_off(end + 2);
            let line = std::str::from_utf8(&buf)
                .map_err(|_| EdgeError::ProxyProtocol("header is not ASCII".into()))?;
            let header = ProxyHeader::parse(line)?;
            conn.unread(rest.freeze());
            return Ok(Some(header));
        }

        if buf.len() >= MAX_HEADER_LEN {
            return Err(EdgeError::ProxyProtocol(format!(
                "header exceeds {MAX_HEADER_LEN} bytes"
            )));
        }

        // Never buffer past the limit, so a CRLF found later is in bounds
        let n = conn.read(&mut chunk[..MAX_HEADER_LEN - buf.len()]).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            if buf.len() < SIGNATURE.len() {
                conn.unread(buf.freeze());
                return Ok(None);
            }
            return Err(EdgeError::ProxyProtocol("connection closed inside header".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncWriteExt, duplex};

    async fn wrapped(input: &'static [u8]) -> ConnWrapper<tokio::io::DuplexStream> {
        let (mut client, server) = duplex(1024);
        client.write_all(input).await.unwrap();
        drop(client);
        ConnWrapper::with_prefix(server, Bytes::new())
    }

    async fn remaining(conn: &mut ConnWrapper<tokio::io::DuplexStream>) -> Vec<u8> {
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        rest
    }

    #[tokio::test]
    async fn test_reads_tcp4_header_and_keeps_payload() {
        let mut conn = wrapped(b"PROXY TCP4 192.0.2.7 198.51.100.1 51000 443\r\n\x16\x03\x01").await;
        let header = read_proxy_header(&mut conn).await.unwrap().unwrap();
        assert_eq!(header.source(), Some("192.0.2.7:51000".parse().unwrap()));
        assert_eq!(remaining(&mut conn).await, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_no_header_leaves_stream_intact() {
        let mut conn = wrapped(b"\x16\x03\x01\x02\x00").await;
        assert!(read_proxy_header(&mut conn).await.unwrap().is_none());
        assert_eq!(remaining(&mut conn).await, b"\x16\x03\x01\x02\x00");
    }

    #[tokio::test]
    async fn test_unknown_keeps_socket_address() {
        let mut conn = wrapped(b"PROXY UNKNOWN\r\nrest").await;
        let header = read_proxy_header(&mut conn).await.unwrap().unwrap();
        assert_eq!(header, ProxyHeader::Unknown);
        assert_eq!(header.source(), None);
        assert_eq!(remaining(&mut conn).await, b"rest");
    }

    #[tokio::test]
    async fn test_malformed_header_fails() {
        let mut conn = wrapped(b"PROXY TCP4 not-an-ip 198.51.100.1 1 2\r\n").await;
        assert!(matches!(
            read_proxy_header(&mut conn).await,
            Err(EdgeError::ProxyProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_fails() {
        static LONG: [u8; 200] = {
            let mut b = [b'1'; 200];
            b[0] = b'P';
            b[1] = b'R';
            b[2] = b'O';
            b[3] = b'X';
            b[4] = b'Y';
            b[5] = b' ';
            b
        };
        let mut conn = wrapped(&LONG).await;
        assert!(read_proxy_header(&mut conn).await.is_err());
    }

    #[tokio::test]
    async fn test_header_ending_past_limit_fails() {
        let (mut client, server) = duplex(1024);
        let mut conn = ConnWrapper::with_prefix(server, Bytes::new());
        tokio::spawn(async move {
            client.write_all(b"PROXY TCP4 192.0.2.7 198.51.100.1 ").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let padded = format!("{}51000 443\r\n", " ".repeat(80));
            client.write_all(padded.as_bytes()).await.unwrap();
        });

        match read_proxy_header(&mut conn).await {
            Err(EdgeError::ProxyProtocol(msg)) => assert!(msg.contains("exceeds"), "{msg}"),
            other => panic!("expected an oversized header error, got {other:?}"),
        }
    }

    #[test]
    fn test_family_mismatch_rejected() {
        assert!(ProxyHeader::parse("PROXY TCP4 ::1 198.51.100.1 1 2\r\n").is_err());
        assert!(ProxyHeader::parse("PROXY TCP6 ::1 ::2 1 2 3\r\n").is_err());
    }

    #[test]
    fn test_outbound_header_follows_client_family() {
        let v4 = ProxyHeader::for_connection(
            "192.0.2.7:51000".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
        );
        assert_eq!(v4.encode(), "PROXY TCP4 192.0.2.7 10.0.0.2 51000 443\r\n");

        let mapped = ProxyHeader::for_connection(
            "192.0.2.7:51000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        assert_eq!(
            mapped.encode(),
            "PROXY TCP6 ::ffff:192.0.2.7 2001:db8::2 51000 443\r\n"
        );
    }
}
