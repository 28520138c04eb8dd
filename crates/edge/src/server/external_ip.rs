//! The edge's own public address, as served in A/AAAA answers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::error::{EdgeError, Result};
use crate::server::dns::DnsServer;

/// How long a resolved address is trusted before resolving again
pub const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Where the external address comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "lowercase")]
pub enum ExternalIpSource {
    /// A fixed address
    Static(IpAddr),
    /// A hostname (typically a dynamic-DNS name) resolved by the system resolver
    Dns(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    const fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// An external address source of one family with a short-lived cache
#[derive(Debug)]
pub struct ExternalIp {
    source: ExternalIpSource,
    family: IpFamily,
    cached: Mutex<Option<(IpAddr, Instant)>>,
}

impl ExternalIp {
    pub fn new(source: ExternalIpSource, family: IpFamily) -> Self {
        Self {
            source,
            family,
            cached: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &ExternalIpSource {
        &self.source
    }

    /// Current address; a resolution failure falls back to the last good one
    pub async fn resolve(&self) -> Result<IpAddr> {
        let host = match &self.source {
            ExternalIpSource::Static(ip) if self.family.matches(ip) => return Ok(*ip),
            ExternalIpSource::Static(ip) => {
                return Err(EdgeError::Config(format!(
                    "external address {ip} is not {:?}",
                    self.family
                )));
            }
            ExternalIpSource::Dns(host) => host,
        };

        let mut cached = self.cached.lock().await;
        if let Some((ip, at)) = *cached
            && at.elapsed() < RESOLVE_CACHE_TTL
        {
            return Ok(ip);
        }

        debug!("Resolving external address {}", host);
        let resolved = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map(|addrs| addrs.map(|a| a.ip()).find(|ip| self.family.matches(ip)));

        match resolved {
            Ok(Some(ip)) => {
                *cached = Some((ip, Instant::now()));
                Ok(ip)
            }
            Ok(None) => (*cached).map(|(ip, _)| ip).ok_or_else(|| {
                EdgeError::Config(format!("{host} has no {:?} address", self.family))
            }),
            Err(e) => {
                warn!("Resolving {} failed: {}", host, e);
                (*cached).map(|(ip, _)| ip).ok_or(EdgeError::Io(e))
            }
        }
    }
}

/// Keep the DNS server's external addresses current until cancelled
pub async fn run_refresher(
    dns: DnsServer,
    ipv4: Option<ExternalIp>,
    ipv6: Option<ExternalIp>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut last_v4: Option<Ipv4Addr> = None;
    let mut last_v6: Option<Ipv6Addr> = None;

    loop {
        if let Some(source) = &ipv4 {
            match source.resolve().await {
                Ok(IpAddr::V4(ip)) if last_v4 != Some(ip) => {
                    info!("External IPv4 address is {}", ip);
                    dns.set_external_ip(ip).await;
                    last_v4 = Some(ip);
                }
                Ok(_) => {}
                Err(e) => warn!("No external IPv4 address: {}", e),
            }
        }
        if let Some(source) = &ipv6 {
            match source.resolve().await {
                Ok(IpAddr::V6(ip)) if last_v6 != Some(ip) => {
                    info!("External IPv6 address is {}", ip);
                    dns.set_external_ipv6(ip).await;
                    last_v6 = Some(ip);
                }
                Ok(_) => {}
                Err(e) => warn!("No external IPv6 address: {}", e),
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let external = ExternalIp::new(ExternalIpSource::Static(ip), IpFamily::V4);
        assert_eq!(external.resolve().await.unwrap(), ip);

        let wrong_family = ExternalIp::new(ExternalIpSource::Static(ip), IpFamily::V6);
        assert!(wrong_family.resolve().await.is_err());
    }

    #[tokio::test]
    async fn test_dns_source_resolves_literal() {
        let external = ExternalIp::new(ExternalIpSource::Dns("127.0.0.1".into()), IpFamily::V4);
        assert_eq!(
            external.resolve().await.unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_source_config_shape() {
        let source: ExternalIpSource =
            serde_json::from_str(r#"{"source":"dns","value":"home.example.net"}"#).unwrap();
        assert_eq!(source, ExternalIpSource::Dns("home.example.net".into()));

        let source: ExternalIpSource =
            serde_json::from_str(r#"{"source":"static","value":"2001:db8::1"}"#).unwrap();
        assert!(matches!(source, ExternalIpSource::Static(IpAddr::V6(_))));
    }

    #[tokio::test]
    async fn test_refresher_publishes_address() {
        let dns = DnsServer::new(Default::default());
        let shutdown = CancellationToken::new();
        let ipv4 = ExternalIp::new(
            ExternalIpSource::Static("203.0.113.5".parse().unwrap()),
            IpFamily::V4,
        );

        let task = tokio::spawn(run_refresher(
            dns.clone(),
            Some(ipv4),
            None,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));
        for _ in 0..100 {
            if dns.external_ip().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dns.external_ip().await, Some("203.0.113.5".parse().unwrap()));

        shutdown.cancel();
        task.await.unwrap();
    }
}
