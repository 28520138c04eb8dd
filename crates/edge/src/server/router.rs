//! SNI router: one TLS port, many virtual hosts
//!
//! Every accepted connection is read up to the end of its ClientHello through
//! a recording [`ConnWrapper`]. The announced server name picks a
//! [`Binding`]:
//!
//! - no binding: the connection is dropped without a single byte written
//! - passthrough: the recorded bytes are replayed to a dialed backend and the
//!   two sides are spliced, TLS is never terminated here
//! - terminating: the recording is rewound, the handshake is completed with
//!   the installed [`TlsMaterial`] and the decrypted stream goes to the handler

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use edge_core::tracing::{
    CorrelationId,
    metrics::{counter, gauge, histogram},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::common::error::{EdgeError, Result};
use crate::common::hostname::{HostnamePattern, lookup_keys};
use crate::common::types::{ConnectionInfo, ConnectionMetric, ConnectionOutcome};
use crate::server::conn::{BoxedIo, ConnWrapper};
use crate::server::dial::Dialer;
use crate::server::handler::TerminatingHandler;
use crate::server::proxy_protocol::read_proxy_header;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked once per finished connection
pub type MetricCallback = Arc<dyn Fn(&ConnectionMetric) + Send + Sync>;

/// What a hostname pattern is routed to
#[derive(Clone)]
pub enum Binding {
    /// Complete the handshake locally and hand over the decrypted stream
    Terminating(Arc<dyn TerminatingHandler>),
    /// Splice the raw TLS stream to a backend
    Passthrough(Arc<dyn Dialer>),
}

impl Binding {
    pub fn terminating(handler: impl TerminatingHandler + 'static) -> Self {
        Self::Terminating(Arc::new(handler))
    }

    pub fn passthrough(dialer: impl Dialer + 'static) -> Self {
        Self::Passthrough(Arc::new(dialer))
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Terminating(_) => "terminating",
            Self::Passthrough(_) => "passthrough",
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminating(_) => f.write_str("Terminating"),
            Self::Passthrough(dialer) => write!(f, "Passthrough({})", dialer.describe()),
        }
    }
}

/// A certificate chain, its key, and the server configuration built from them
///
/// Built once at install time; handshakes share it through an `Arc`.
pub struct TlsMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    config: Arc<ServerConfig>,
}

impl TlsMaterial {
    /// `chain` is leaf first
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        if chain.is_empty() {
            return Err(EdgeError::Certificate("empty certificate chain".into()));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key.clone_key())?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            chain,
            key,
            config: Arc::new(config),
        })
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Router tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Expect an optional PROXY v1 line before the ClientHello
    pub proxy_protocol: bool,
    pub client_hello_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound on bytes buffered while looking for the ClientHello
    pub max_client_hello: usize,
    /// Concurrent connections per listener
    pub max_connections: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            proxy_protocol: false,
            client_hello_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_client_hello: 64 * 1024,
            max_connections: 1000,
        }
    }
}

#[derive(Default)]
struct Tables {
    bindings: HashMap<String, Binding>,
    certificates: HashMap<String, Arc<TlsMaterial>>,
    internal: HashSet<String>,
}

/// The SNI router
#[derive(Clone)]
pub struct SniRouter {
    config: Arc<RouterConfig>,
    tables: Arc<RwLock<Tables>>,
    metric_callback: Arc<RwLock<Option<MetricCallback>>>,
}

impl SniRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config: Arc::new(config),
            tables: Arc::new(RwLock::new(Tables::default())),
            metric_callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Bind a pattern, replacing whatever it was bound to before
    pub async fn add_handler(&self, pattern: &HostnamePattern, binding: Binding) {
        info!("Routing {} ({})", pattern, binding.kind());
        self.tables
            .write()
            .await
            .bindings
            .insert(pattern.to_string(), binding);
    }

    /// Remove a binding and its internal-only flag
    pub async fn delete_handler(&self, pattern: &HostnamePattern) {
        let mut tables = self.tables.write().await;
        tables.bindings.remove(pattern.as_str());
        tables.internal.remove(pattern.as_str());
        debug!("Removed route for {}", pattern);
    }

    /// Restrict a pattern to connections accepted on the internal listener
    pub async fn mark_internal(&self, pattern: &HostnamePattern) {
        self.tables
            .write()
            .await
            .internal
            .insert(pattern.to_string());
    }

    /// Install certificate material for a pattern
    ///
    /// Handshakes already running keep the material they started with.
    pub async fn install_certificate(
        &self,
        pattern: &HostnamePattern,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<()> {
        let material = Arc::new(TlsMaterial::new(chain, key)?);
        self.tables
            .write()
            .await
            .certificates
            .insert(pattern.to_string(), material);
        counter("edge_certificates_installed_total").increment();
        info!("Installed certificate for {}", pattern);
        Ok(())
    }

    pub async fn remove_certificate(&self, pattern: &HostnamePattern) {
        self.tables
            .write()
            .await
            .certificates
            .remove(pattern.as_str());
    }

    pub async fn set_metric_callback(&self, callback: MetricCallback) {
        *self.metric_callback.write().await = Some(callback);
    }

    /// Binding for a server name: exact pattern first, then the wildcard
    ///
    /// Returns the matching key with the binding. Internal-only patterns are
    /// invisible to public connections.
    pub async fn lookup_binding(&self, sni: &str, internal: bool) -> Option<(String, Binding)> {
        let keys = lookup_keys(sni);
        let tables = self.tables.read().await;
        let (key, binding) = keys
            .into_iter()
            .find_map(|k| tables.bindings.get(&k).cloned().map(|b| (k, b)))?;
        if !internal && tables.internal.contains(&key) {
            return None;
        }
        Some((key, binding))
    }

    /// Certificate material for a server name, same matching rule as bindings
    pub async fn lookup_certificate(&self, sni: &str) -> Option<Arc<TlsMaterial>> {
        let keys = lookup_keys(sni);
        let tables = self.tables.read().await;
        keys.iter().find_map(|k| tables.certificates.get(k).cloned())
    }

    /// Accept connections until `shutdown` fires
    ///
    /// Connections already accepted are left to finish on their own.
    pub async fn run(
        &self,
        listener: TcpListener,
        internal: bool,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "SNI router listening on {} ({})",
            local_addr,
            if internal { "internal" } else { "public" }
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed on {}: {}", local_addr, e);
                    if accept_backoff(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };
            // Nagle would delay the replayed ClientHello.
            let _ = stream.set_nodelay(true);

            let router = self.clone();
            let info = ConnectionInfo {
                peer_addr,
                internal,
            };
            let conn_id = CorrelationId::new();
            tokio::spawn(
                async move {
                    router.serve(Box::new(stream), info).await;
                    drop(permit);
                }
                .instrument(info_span!("tls_connection", %peer_addr, conn_id = %conn_id)),
            );
        }

        info!("SNI router on {} stopped accepting", local_addr);
        Ok(())
    }

    /// Route one connection to completion and report its outcome
    pub async fn serve(&self, io: BoxedIo, info: ConnectionInfo) -> ConnectionOutcome {
        counter("edge_tls_connections_total").increment();
        gauge("edge_tls_connections_active").increment();
        let start = Instant::now();

        let mut client_addr = info.peer_addr;
        let mut hostname = None;
        let outcome = self
            .route(io, info, &mut client_addr, &mut hostname)
            .await;

        let duration = start.elapsed();
        gauge("edge_tls_connections_active").decrement();
        histogram("edge_tls_connection_duration_seconds").observe(duration.as_secs_f64());
        match outcome {
            ConnectionOutcome::UnknownHostname => counter("edge_tls_rejected_total").increment(),
            ConnectionOutcome::HandshakeFailed => {
                counter("edge_tls_handshake_failures_total").increment();
            }
            _ => {}
        }

        let metric = ConnectionMetric {
            timestamp: Utc::now(),
            client_addr,
            hostname,
            outcome,
            duration,
        };
        let callback = self.metric_callback.read().await.clone();
        if let Some(callback) = callback {
            callback(&metric);
        }
        outcome
    }

    #[instrument(
        name = "route_connection",
        skip_all,
        fields(peer_addr = %info.peer_addr, hostname = tracing::field::Empty)
    )]
    async fn route(
        &self,
        io: BoxedIo,
        mut info: ConnectionInfo,
        client_addr: &mut SocketAddr,
        hostname: &mut Option<String>,
    ) -> ConnectionOutcome {
        let mut conn = ConnWrapper::with_prefix(io, Bytes::new());

        if self.config.proxy_protocol {
            match timeout(self.config.client_hello_timeout, read_proxy_header(&mut conn)).await {
                Ok(Ok(header)) => {
                    if let Some(source) = header.and_then(|h| h.source()) {
                        info.peer_addr = source;
                        *client_addr = source;
                    }
                }
                Ok(Err(e)) => {
                    debug!("Rejecting PROXY header: {}", e);
                    return ConnectionOutcome::ProxyHeaderInvalid;
                }
                Err(_) => {
                    debug!("Timed out waiting for PROXY header");
                    return ConnectionOutcome::ProxyHeaderInvalid;
                }
            }
        }

        conn.start_caching();
        let sni = match timeout(
            self.config.client_hello_timeout,
            read_client_hello(&mut conn, self.config.max_client_hello),
        )
        .await
        {
            Ok(Ok(Some(sni))) => sni,
            Ok(Ok(None)) => {
                debug!("ClientHello without server name, dropped");
                return ConnectionOutcome::UnknownHostname;
            }
            Ok(Err(e)) => {
                debug!("Unreadable ClientHello: {}", e);
                return ConnectionOutcome::HandshakeFailed;
            }
            Err(_) => {
                debug!("Timed out waiting for ClientHello");
                return ConnectionOutcome::HandshakeFailed;
            }
        };
        tracing::Span::current().record("hostname", sni.as_str());
        *hostname = Some(sni.clone());

        let Some((pattern, binding)) = self.lookup_binding(&sni, info.internal).await else {
            debug!("No route for {}, dropped", sni);
            return ConnectionOutcome::UnknownHostname;
        };

        match binding {
            Binding::Passthrough(dialer) => self.forward(conn, &sni, &info, dialer.as_ref()).await,
            Binding::Terminating(handler) => {
                let Some(material) = self.lookup_certificate(&sni).await else {
                    debug!("No certificate for {} (route {}), dropped", sni, pattern);
                    return ConnectionOutcome::HandshakeFailed;
                };

                conn.rewind();
                let acceptor = TlsAcceptor::from(material.server_config());
                let tls = match timeout(self.config.handshake_timeout, acceptor.accept(conn)).await
                {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        debug!("Handshake for {} failed: {}", sni, e);
                        return ConnectionOutcome::HandshakeFailed;
                    }
                    Err(_) => {
                        debug!("Handshake for {} timed out", sni);
                        return ConnectionOutcome::HandshakeFailed;
                    }
                };

                if let Err(e) = handler.handle(tls, info).await
                    && !e.is_connection_closed()
                {
                    warn!("Handler for {} failed: {}", sni, e);
                }
                ConnectionOutcome::Terminated
            }
        }
    }

    async fn forward(
        &self,
        mut conn: ConnWrapper<BoxedIo>,
        sni: &str,
        info: &ConnectionInfo,
        dialer: &dyn Dialer,
    ) -> ConnectionOutcome {
        let client_hello = conn.take_cached();

        let mut backend = match dialer.dial(sni, info).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Dial {} for {} failed: {}", dialer.describe(), sni, e);
                return ConnectionOutcome::DialFailed;
            }
        };
        if let Err(e) = backend.write_all(&client_hello).await {
            warn!("Replaying ClientHello to {} failed: {}", dialer.describe(), e);
            return ConnectionOutcome::DialFailed;
        }

        debug!("Forwarding {} -> {}", sni, dialer.describe());
        match tokio::io::copy_bidirectional(&mut conn, &mut backend).await {
            Ok((from_client, from_backend)) => {
                counter("edge_passthrough_bytes_received")
                    .add(from_client + client_hello.len() as u64);
                counter("edge_passthrough_bytes_sent").add(from_backend);
                debug!(
                    "Passthrough {} closed ({} bytes up, {} bytes down)",
                    sni,
                    from_client + client_hello.len() as u64,
                    from_backend
                );
            }
            Err(e) => debug!("Passthrough {} ended: {}", sni, e),
        }
        ConnectionOutcome::Forwarded
    }
}

impl std::fmt::Debug for SniRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read through the wrapper until a full ClientHello has been seen
///
/// Nothing is written to the peer. Returns the lowercased server name, or
/// `None` when the client sent none.
pub async fn read_client_hello<S>(conn: &mut ConnWrapper<S>, limit: usize) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut acceptor = Acceptor::default();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(EdgeError::Protocol("connection closed before ClientHello".into()));
        }

        let mut pending = &buf[..n];
        while !pending.is_empty() {
            if acceptor.read_tls(&mut pending)? == 0 {
                return Err(EdgeError::Protocol("ClientHello buffer full".into()));
            }
        }

        match acceptor.accept() {
            Ok(None) => {
                if conn.cached_len() > limit {
                    return Err(EdgeError::Protocol(format!(
                        "ClientHello larger than {limit} bytes"
                    )));
                }
            }
            Ok(Some(accepted)) => {
                return Ok(accepted
                    .client_hello()
                    .server_name()
                    .map(str::to_ascii_lowercase));
            }
            // The alert is never written to the peer.
            Err((e, _alert)) => return Err(e.into()),
        }
    }
}

/// Pause after a failed accept (e.g. EMFILE); `false` once shutdown fired
pub(crate) async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}
