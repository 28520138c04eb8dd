//! Authoritative DNS for the domains the edge fronts
//!
//! Only the records the edge needs are synthesized: the edge's own address
//! for subdomains, the ACME DNS-01 challenge TXT record, and the NS/SOA
//! bookkeeping resolvers expect from an authority. Proxy domains are relayed
//! verbatim to another nameserver.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use edge_core::tracing::metrics::counter;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::client::acme::ChallengeHandler;
use crate::common::error::{EdgeError, Result};
use crate::common::hostname::normalize;
use crate::server::router::accept_backoff;
use crate::server::tsig::{TsigKeyring, TsigVerification};

/// Host label under which DNS-01 challenges are published
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

const CHALLENGE_TTL: u32 = 10;
const RECORD_TTL: u32 = 60;
const MAX_UDP_MESSAGE: usize = 4096;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a proxy domain's queries are relayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    Udp(String),
    Tcp(String),
}

impl ProxyTarget {
    /// `udp://host:port`, `tcp://host:port`, or a bare `host:port` (UDP)
    pub fn parse(target: &str) -> Result<Self> {
        let parsed = if let Some(addr) = target.strip_prefix("tcp://") {
            Self::Tcp(addr.to_string())
        } else {
            Self::Udp(target.strip_prefix("udp://").unwrap_or(target).to_string())
        };
        let addr = match &parsed {
            Self::Udp(addr) | Self::Tcp(addr) => addr,
        };
        if addr.is_empty() || !addr.contains(':') {
            return Err(EdgeError::Config(format!("invalid DNS proxy target {target}")));
        }
        Ok(parsed)
    }
}

#[derive(Debug, Default, Clone)]
struct DomainEntry {
    challenge: Option<String>,
    proxy: Option<ProxyTarget>,
}

#[derive(Debug, Default)]
struct DnsState {
    domains: HashMap<String, DomainEntry>,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

impl DnsState {
    /// Longest configured domain equal to or a parent of `qname`, with the
    /// host part in front of it
    fn find(&self, qname: &str) -> Option<(&str, &DomainEntry, String)> {
        self.domains
            .iter()
            .filter_map(|(domain, entry)| {
                if qname == domain {
                    Some((domain.as_str(), entry, String::new()))
                } else {
                    qname
                        .strip_suffix(domain.as_str())
                        .and_then(|host| host.strip_suffix('.'))
                        .filter(|host| !host.is_empty())
                        .map(|host| (domain.as_str(), entry, host.to_string()))
                }
            })
            .max_by_key(|(domain, _, _)| domain.len())
    }
}

/// Server tuning
#[derive(Debug)]
pub struct DnsOptions {
    /// Budget for one relayed query to a proxy target
    pub proxy_timeout: Duration,
    pub tsig: TsigKeyring,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            proxy_timeout: Duration::from_secs(5),
            tsig: TsigKeyring::default(),
        }
    }
}

/// The DNS authority; cheap to clone, all clones share one domain table
#[derive(Debug, Clone)]
pub struct DnsServer {
    state: Arc<RwLock<DnsState>>,
    tsig: Arc<TsigKeyring>,
    proxy_timeout: Duration,
}

impl DnsServer {
    pub fn new(options: DnsOptions) -> Self {
        Self {
            state: Arc::new(RwLock::new(DnsState::default())),
            tsig: Arc::new(options.tsig),
            proxy_timeout: options.proxy_timeout,
        }
    }

    /// Become authoritative for `names`; existing entries are kept as they are
    pub async fn add_domains<S: AsRef<str>>(&self, names: &[S]) {
        let mut state = self.state.write().await;
        for name in names {
            let name = normalize(name.as_ref());
            info!("DNS authority for {}", name);
            state.domains.entry(name).or_default();
        }
    }

    pub async fn del_domains<S: AsRef<str>>(&self, names: &[S]) {
        let mut state = self.state.write().await;
        for name in names {
            if state.domains.remove(&normalize(name.as_ref())).is_some() {
                info!("Dropped DNS authority for {}", name.as_ref());
            }
        }
    }

    /// Relay every query under `domain` to another nameserver
    pub async fn add_proxy_domain(&self, domain: &str, target: &str) -> Result<()> {
        let target = ProxyTarget::parse(target)?;
        info!("DNS queries for {} relayed to {:?}", domain, target);
        self.state
            .write()
            .await
            .domains
            .entry(normalize(domain))
            .or_default()
            .proxy = Some(target);
        Ok(())
    }

    pub async fn set_external_ip(&self, ip: Ipv4Addr) {
        self.state.write().await.ipv4 = Some(ip);
    }

    pub async fn set_external_ipv6(&self, ip: Ipv6Addr) {
        self.state.write().await.ipv6 = Some(ip);
    }

    pub async fn external_ip(&self) -> Option<Ipv4Addr> {
        self.state.read().await.ipv4
    }

    pub async fn external_ipv6(&self) -> Option<Ipv6Addr> {
        self.state.read().await.ipv6
    }

    pub async fn has_domain(&self, domain: &str) -> bool {
        self.state.read().await.domains.contains_key(&normalize(domain))
    }

    /// Publish the DNS-01 value for a domain, replacing any previous one
    ///
    /// Unknown domains are ignored.
    pub async fn set_challenge(&self, domain: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().await;
        match state.domains.get_mut(&normalize(domain)) {
            Some(entry) => {
                info!("DNS challenge for {} published", domain);
                entry.challenge = Some(value.to_string());
            }
            None => debug!("Ignoring challenge for unknown domain {}", domain),
        }
        Ok(())
    }

    /// Synthesize the reply to a query for a locally served domain
    pub async fn answer(&self, request: &Message) -> Message {
        let mut response = reply_to(request);
        let Some(query) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };

        let qname = normalize(&query.name().to_ascii());
        let state = self.state.read().await;
        let Some((domain, entry, host)) = state.find(&qname) else {
            return response;
        };
        let Ok(zone) = Name::from_ascii(format!("{domain}.")) else {
            return response;
        };
        response.set_authoritative(true);

        let name = query.name().clone();
        match query.query_type() {
            RecordType::TXT if host == ACME_CHALLENGE_LABEL => {
                if let Some(challenge) = &entry.challenge {
                    response.add_answer(Record::from_rdata(
                        name,
                        CHALLENGE_TTL,
                        RData::TXT(TXT::new(vec![challenge.clone()])),
                    ));
                }
                add_ns(&mut response, &zone);
            }
            RecordType::A if !host.is_empty() => {
                if let Some(ip) = state.ipv4 {
                    response.add_answer(Record::from_rdata(name, RECORD_TTL, RData::A(A(ip))));
                }
                add_ns(&mut response, &zone);
            }
            RecordType::AAAA if !host.is_empty() => {
                if let Some(ip) = state.ipv6 {
                    response.add_answer(Record::from_rdata(name, RECORD_TTL, RData::AAAA(AAAA(ip))));
                }
                add_ns(&mut response, &zone);
            }
            RecordType::CNAME if !host.is_empty() => add_ns(&mut response, &zone),
            RecordType::NS if host.is_empty() => {
                if let Some(record) = ns_record(&zone) {
                    response.add_answer(record);
                }
            }
            RecordType::SOA if host.is_empty() => {
                if let Some(record) = soa_record(&zone) {
                    response.add_answer(record);
                }
            }
            _ => {}
        }

        if response.answers().is_empty()
            && let Some(soa) = soa_record(&zone)
        {
            response.add_name_server(soa);
        }
        response
    }

    /// Handle one wire-format query; `None` means the packet is dropped
    pub async fn handle_query(&self, raw: &[u8]) -> Option<Vec<u8>> {
        counter("edge_dns_queries_total").increment();

        let request = match Message::from_vec(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping unparsable DNS message: {}", e);
                return None;
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        if let Some(query) = request.queries().first() {
            debug!("DNS {} {}", query.query_type(), query.name());
            if let Some(target) = self.proxy_target(&query.name().to_ascii()).await {
                match self.relay(&target, raw).await {
                    Ok(reply) => {
                        counter("edge_dns_proxied_total").increment();
                        return Some(reply);
                    }
                    Err(e) => {
                        warn!("DNS relay to {:?} failed: {}", target, e);
                        return reply_to(&request).to_vec().ok();
                    }
                }
            }
        }

        let mut response = self.answer(&request).await;
        match self.tsig.verify(&request, raw) {
            TsigVerification::Unsigned => {}
            TsigVerification::Verified { key, request_mac } => {
                if let Err(e) = self.tsig.sign(&mut response, &key, &request_mac) {
                    warn!("Could not sign DNS reply with {}: {}", key, e);
                }
            }
            TsigVerification::Failed(reason) => warn!("TSIG verification failed: {}", reason),
        }

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Could not encode DNS reply: {}", e);
                None
            }
        }
    }

    async fn proxy_target(&self, qname: &str) -> Option<ProxyTarget> {
        let state = self.state.read().await;
        state
            .find(&normalize(qname))
            .and_then(|(_, entry, _)| entry.proxy.clone())
    }

    async fn relay(&self, target: &ProxyTarget, raw: &[u8]) -> Result<Vec<u8>> {
        let exchange = async {
            match target {
                ProxyTarget::Udp(addr) => {
                    let remote = tokio::net::lookup_host(addr.as_str())
                        .await?
                        .next()
                        .ok_or_else(|| EdgeError::Config(format!("cannot resolve {addr}")))?;
                    let local: SocketAddr = if remote.is_ipv4() {
                        (Ipv4Addr::UNSPECIFIED, 0).into()
                    } else {
                        (Ipv6Addr::UNSPECIFIED, 0).into()
                    };
                    let socket = UdpSocket::bind(local).await?;
                    socket.connect(remote).await?;
                    socket.send(raw).await?;
                    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
                    let n = socket.recv(&mut buf).await?;
                    buf.truncate(n);
                    Ok::<_, EdgeError>(buf)
                }
                ProxyTarget::Tcp(addr) => {
                    let mut stream = TcpStream::connect(addr.as_str()).await?;
                    write_framed(&mut stream, raw).await?;
                    read_framed(&mut stream).await
                }
            }
        };

        timeout(self.proxy_timeout, exchange)
            .await
            .map_err(|_| EdgeError::Timeout(format!("DNS relay to {target:?}")))?
    }

    /// Serve UDP and TCP on the same address until `shutdown` fires
    pub async fn run(&self, bind_addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let udp = UdpSocket::bind(bind_addr).await?;
        let tcp = TcpListener::bind(bind_addr).await?;
        info!("DNS server listening on {} (udp+tcp)", bind_addr);

        tokio::try_join!(
            self.serve_udp(udp, shutdown.clone()),
            self.serve_tcp(tcp, shutdown)
        )?;
        Ok(())
    }

    pub async fn serve_udp(&self, socket: UdpSocket, shutdown: CancellationToken) -> Result<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];

        loop {
            let (n, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("DNS UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            let packet = buf[..n].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(
                async move {
                    if let Some(reply) = server.handle_query(&packet).await
                        && let Err(e) = socket.send_to(&reply, peer).await
                    {
                        debug!("DNS UDP reply to {} failed: {}", peer, e);
                    }
                }
                .instrument(info_span!("dns_query", %peer, transport = "udp")),
            );
        }
        Ok(())
    }

    pub async fn serve_tcp(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (mut stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("DNS TCP accept failed: {}", e);
                    if accept_backoff(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            let server = self.clone();
            tokio::spawn(
                async move {
                    loop {
                        let query = match timeout(TCP_IDLE_TIMEOUT, read_framed(&mut stream)).await {
                            Ok(Ok(query)) => query,
                            Ok(Err(_)) | Err(_) => break,
                        };
                        let Some(reply) = server.handle_query(&query).await else {
                            break;
                        };
                        if let Err(e) = write_framed(&mut stream, &reply).await {
                            debug!("DNS TCP reply to {} failed: {}", peer, e);
                            break;
                        }
                    }
                }
                .instrument(info_span!("dns_query", %peer, transport = "tcp")),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeHandler for DnsServer {
    async fn set_challenge(&self, domain: &str, value: &str) -> Result<()> {
        DnsServer::set_challenge(self, domain, value).await
    }
}

fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .add_queries(request.queries().to_vec());
    response
}

fn ns_host(zone: &Name) -> Option<Name> {
    Name::from_ascii("ns1").ok()?.append_domain(zone).ok()
}

fn ns_record(zone: &Name) -> Option<Record> {
    let host = ns_host(zone)?;
    Some(Record::from_rdata(zone.clone(), RECORD_TTL, RData::NS(NS(host))))
}

fn add_ns(response: &mut Message, zone: &Name) {
    if let Some(record) = ns_record(zone) {
        response.add_name_server(record);
    }
}

fn soa_record(zone: &Name) -> Option<Record> {
    let mname = ns_host(zone)?;
    let rname = Name::from_ascii("admin").ok()?.append_domain(zone).ok()?;
    let serial = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    Some(Record::from_rdata(
        zone.clone(),
        RECORD_TTL,
        RData::SOA(SOA::new(mname, rname, serial, 28800, 7200, 600, 60)),
    ))
}

/// Read one length-prefixed DNS message (RFC 1035 §4.2.2)
async fn read_framed<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

async fn write_framed<S: AsyncWrite + Unpin>(stream: &mut S, message: &[u8]) -> Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| EdgeError::Protocol("DNS message too large for TCP".into()))?;
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await?;
    Ok(())
}
