//! Wires the router, DNS authority, redirect front and certificate manager
//! together from an [`EdgeConfig`]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::routing::get;
use edge_core::tracing::metrics::{gauge, global};
use edge_core::tracing::prometheus::{create_metrics_snapshot, prometheus_format};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::acme::{AcmeClient, CertificateIssuer, ChallengeHandler};
use crate::client::certificate_manager::CertificateManager;
use crate::common::error::{EdgeError, Result};
use crate::common::hostname::{HostnamePattern, normalize};
use crate::common::types::{ConnectionMetric, ConnectionOutcome};
use crate::server::config::{DomainConfig, EdgeConfig, RouteConfig, RouteTarget};
use crate::server::dial::TcpDialer;
use crate::server::dns::{DnsOptions, DnsServer};
use crate::server::external_ip::{ExternalIp, IpFamily, run_refresher};
use crate::server::handler::ReverseProxyHandler;
use crate::server::redirect::RedirectFront;
use crate::server::router::{Binding, SniRouter};
use crate::server::state_dir::EdgeStateDir;
use crate::server::tsig::TsigKeyring;

struct RunningDomain {
    patterns: Vec<HostnamePattern>,
    redirect: bool,
    stop: CancellationToken,
}

/// One edge instance
pub struct Gateway {
    config: EdgeConfig,
    router: SniRouter,
    dns: DnsServer,
    redirect: RedirectFront,
    certificates: Arc<CertificateManager>,
    running: Mutex<HashMap<String, RunningDomain>>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build a gateway that obtains certificates from the configured ACME CA
    pub async fn new(config: EdgeConfig, state_dir: &EdgeStateDir) -> Result<Self> {
        state_dir.create_directories().await?;
        let dns = build_dns(&config)?;
        let challenges: Arc<dyn ChallengeHandler> = Arc::new(dns.clone());
        let acme = AcmeClient::new(
            config.acme.directory_url.clone(),
            config.acme.contact.clone(),
            state_dir.account_path(),
            challenges,
        )
        .with_poll_policy(config.acme.poll_policy());
        Ok(Self::assemble(config, state_dir, dns, Arc::new(acme)))
    }

    /// Build a gateway around another certificate issuer
    pub async fn with_issuer(
        config: EdgeConfig,
        state_dir: &EdgeStateDir,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self> {
        state_dir.create_directories().await?;
        let dns = build_dns(&config)?;
        Ok(Self::assemble(config, state_dir, dns, issuer))
    }

    fn assemble(
        config: EdgeConfig,
        state_dir: &EdgeStateDir,
        dns: DnsServer,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        let router = SniRouter::new(config.https.router_config());
        let certificates = CertificateManager::new(
            state_dir.certs_dir(),
            issuer,
            Arc::new(router.clone()),
        )
        .with_policy(config.certificates.lifecycle_policy());

        Self {
            config,
            router,
            dns,
            redirect: RedirectFront::new(),
            certificates: Arc::new(certificates),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn router(&self) -> &SniRouter {
        &self.router
    }

    pub fn dns(&self) -> &DnsServer {
        &self.dns
    }

    pub fn redirect(&self) -> &RedirectFront {
        &self.redirect
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    /// Cancelling this token stops every listener and background loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start serving a domain, replacing it if it is already running
    pub async fn start_domain(&self, domain: &DomainConfig) -> Result<()> {
        let name = normalize(&domain.name);
        if self.running.lock().await.contains_key(&name) {
            self.stop_domain(&name).await?;
        }

        let running = match &domain.redirect {
            Some(redirect) if !redirect.target.is_empty() => {
                let pattern = HostnamePattern::wildcard(&name)?;
                self.router.mark_internal(&pattern).await;
                let dialer = TcpDialer::new(redirect.https_target())
                    .with_connect_timeout(self.config.https.connect_timeout());
                self.router
                    .add_handler(&pattern, Binding::passthrough(dialer))
                    .await;
                self.dns
                    .add_proxy_domain(&name, &redirect.dns_target())
                    .await?;
                info!("Domain {} redirected to {}", name, redirect.target);
                RunningDomain {
                    patterns: vec![pattern],
                    redirect: true,
                    stop: self.shutdown.child_token(),
                }
            }
            _ => {
                self.dns.add_domains(&[name.as_str()]).await;
                self.certificates.register(&name).await?;

                let mut patterns = Vec::with_capacity(domain.routes.len());
                for route in &domain.routes {
                    let pattern = route.pattern(&name)?;
                    self.router
                        .add_handler(&pattern, self.binding_for(route)?)
                        .await;
                    if route.internal {
                        self.router.mark_internal(&pattern).await;
                    }
                    debug!("Route {} -> {}", pattern, route.target);
                    patterns.push(pattern);
                }

                let stop = self.shutdown.child_token();
                tokio::spawn(
                    self.certificates
                        .clone()
                        .run(name.clone(), stop.clone()),
                );
                info!("Domain {} started with {} routes", name, patterns.len());
                RunningDomain {
                    patterns,
                    redirect: false,
                    stop,
                }
            }
        };

        self.running.lock().await.insert(name, running);
        gauge("edge_domains_active").increment();
        Ok(())
    }

    /// Undo [`Gateway::start_domain`]
    pub async fn stop_domain(&self, name: &str) -> Result<()> {
        let name = normalize(name);
        let Some(running) = self.running.lock().await.remove(&name) else {
            return Err(EdgeError::Config(format!("domain {name} is not running")));
        };

        running.stop.cancel();
        for pattern in &running.patterns {
            self.router.delete_handler(pattern).await;
        }
        self.dns.del_domains(&[name.as_str()]).await;
        if !running.redirect {
            // Unregister first: an issuance finishing later finds no domain
            self.certificates.unregister(&name).await;
            self.router
                .remove_certificate(&HostnamePattern::wildcard(&name)?)
                .await;
        }

        gauge("edge_domains_active").decrement();
        info!("Domain {} stopped", name);
        Ok(())
    }

    fn binding_for(&self, route: &RouteConfig) -> Result<Binding> {
        Ok(match route.route_target()? {
            RouteTarget::Passthrough(target) => Binding::passthrough(
                TcpDialer::new(target)
                    .with_proxy_protocol(route.proxy_protocol)
                    .with_connect_timeout(self.config.https.connect_timeout()),
            ),
            RouteTarget::ReverseProxy(backend) => {
                Binding::terminating(ReverseProxyHandler::new(&backend)?)
            }
        })
    }

    /// `/metrics` and `/health`
    pub fn status_router(self: &Arc<Self>) -> axum::Router {
        let gateway = self.clone();
        axum::Router::new()
            .route("/metrics", get(|| async { prometheus_format() }))
            .route(
                "/health",
                get(move || {
                    let gateway = gateway.clone();
                    async move {
                        Json(json!({
                            "status": "ok",
                            "certificates": gateway.certificates.statuses().await,
                            "metrics": create_metrics_snapshot(global()),
                        }))
                    }
                }),
            )
    }

    /// Bind every configured listener, start all domains and serve until
    /// the shutdown token fires
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        self.router
            .set_metric_callback(Arc::new(log_connection))
            .await;

        let https = TcpListener::bind(self.config.https.bind_addr).await?;
        {
            let router = self.router.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { router.run(https, false, shutdown).await });
        }

        if let Some(addr) = self.config.https.internal_bind_addr {
            let internal = TcpListener::bind(addr).await?;
            let router = self.router.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { router.run(internal, true, shutdown).await });
        }

        if self.config.dns.enabled {
            let dns = self.dns.clone();
            let addr = self.config.dns.bind_addr;
            let shutdown = shutdown.clone();
            tasks.spawn(async move { dns.run(addr, shutdown).await });
            self.spawn_external_ip_refresher(&mut tasks);
        }

        if self.config.http.enabled {
            let listener = TcpListener::bind(self.config.http.bind_addr).await?;
            let front = self.redirect.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { front.run(listener, shutdown).await });
        }

        if let Some(addr) = self.config.server.status_addr {
            let listener = TcpListener::bind(addr).await?;
            let app = self.status_router();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                info!("Status endpoint available at http://{}/health", addr);
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await?;
                Ok(())
            });
        }

        for domain in &self.config.domains {
            if let Err(e) = self.start_domain(domain).await {
                error!("Failed to start domain {}: {}", domain.name, e);
            }
        }

        let mut result = Ok(());
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!("Listener failed: {}", e);
                        result = Err(e);
                        shutdown.cancel();
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Listener task panicked: {}", e);
                        shutdown.cancel();
                        break;
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!("Listener exited with error during shutdown: {}", e);
            }
        }
        info!("Edge stopped");
        result
    }

    fn spawn_external_ip_refresher(&self, tasks: &mut JoinSet<Result<()>>) {
        let ipv4 = self
            .config
            .dns
            .external_ipv4
            .clone()
            .map(|source| ExternalIp::new(source, IpFamily::V4));
        let ipv6 = self
            .config
            .dns
            .external_ipv6
            .clone()
            .map(|source| ExternalIp::new(source, IpFamily::V6));
        if ipv4.is_none() && ipv6.is_none() {
            warn!("No external address configured; A/AAAA queries stay unanswered");
            return;
        }

        let dns = self.dns.clone();
        let interval = Duration::from_secs(self.config.dns.refresh_interval_secs);
        let shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            run_refresher(dns, ipv4, ipv6, interval, shutdown).await;
            Ok(())
        });
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

fn build_dns(config: &EdgeConfig) -> Result<DnsServer> {
    Ok(DnsServer::new(DnsOptions {
        proxy_timeout: Duration::from_secs(config.dns.proxy_timeout_secs),
        tsig: TsigKeyring::new(&config.dns.tsig_keys)?,
    }))
}

fn log_connection(metric: &ConnectionMetric) {
    let client: SocketAddr = metric.client_addr;
    match metric.outcome {
        ConnectionOutcome::UnknownHostname => debug!(
            %client,
            hostname = metric.hostname.as_deref().unwrap_or(""),
            "Rejected connection for unknown hostname"
        ),
        outcome if !outcome.is_success() => info!(
            %client,
            hostname = metric.hostname.as_deref().unwrap_or(""),
            %outcome,
            duration_ms = metric.duration.as_millis() as u64,
            "Connection failed"
        ),
        outcome => debug!(
            %client,
            hostname = metric.hostname.as_deref().unwrap_or(""),
            %outcome,
            duration_ms = metric.duration.as_millis() as u64,
            "Connection closed"
        ),
    }
}
