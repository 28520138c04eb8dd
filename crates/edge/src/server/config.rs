//! Edge configuration

use config::{Config, ConfigError, Environment, File};
use edge_core::{ValidateConfig, validators};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::acme::{PollPolicy, default_directory_url};
use crate::client::certificate_manager::LifecyclePolicy;
use crate::common::error::{EdgeError, Result};
use crate::common::hostname::{HostnamePattern, normalize};
use crate::server::external_ip::ExternalIpSource;
use crate::server::router::RouterConfig;
use crate::server::tsig::{TsigKeyConfig, TsigKeyring};

/// Edge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub https: HttpsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub certificates: CertificatesConfig,
    /// Domains served by this edge
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,
    /// Serves `/metrics` and `/health` when set
    #[serde(default)]
    pub status_addr: Option<SocketAddr>,
    /// Overrides the platform state directory
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            status_addr: None,
            state_dir: None,
        }
    }
}

/// TLS listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    #[serde(default = "default_https_addr")]
    pub bind_addr: SocketAddr,
    /// Connections accepted here may reach internal-only hostnames
    #[serde(default)]
    pub internal_bind_addr: Option<SocketAddr>,
    /// Accept a PROXY v1 line ahead of the ClientHello
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_timeout_secs")]
    pub client_hello_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_https_addr(),
            internal_bind_addr: None,
            proxy_protocol: false,
            max_connections: default_max_connections(),
            client_hello_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            handshake_timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpsConfig {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            proxy_protocol: self.proxy_protocol,
            client_hello_timeout: Duration::from_secs(self.client_hello_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_connections: self.max_connections,
            ..RouterConfig::default()
        }
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Plaintext HTTP redirect front
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_http_addr(),
        }
    }
}

/// DNS authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dns_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default)]
    pub external_ipv4: Option<ExternalIpSource>,
    #[serde(default)]
    pub external_ipv6: Option<ExternalIpSource>,
    /// How often hostname-based external addresses are re-resolved
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Budget for relaying a query to a proxy domain target
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    #[serde(default)]
    pub tsig_keys: Vec<TsigKeyConfig>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_dns_addr(),
            external_ipv4: None,
            external_ipv6: None,
            refresh_interval_secs: default_refresh_interval(),
            proxy_timeout_secs: default_proxy_timeout(),
            tsig_keys: Vec::new(),
        }
    }
}

/// ACME account and polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// `mailto:` contact URIs for the account
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Give up on an order after this many polls; unset polls forever
    #[serde(default)]
    pub max_polls: Option<u32>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            contact: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            max_polls: None,
        }
    }
}

impl AcmeConfig {
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_polls: self.max_polls,
        }
    }
}

/// Certificate lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatesConfig {
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Re-issue once this percentage of the lifetime is used
    #[serde(default)]
    pub renew_after_percent: Option<f64>,
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval(),
            renew_after_percent: None,
            recheck_interval_secs: default_recheck_interval(),
        }
    }
}

impl CertificatesConfig {
    pub const fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            renew_after_percent: self.renew_after_percent,
            recheck_interval: Duration::from_secs(self.recheck_interval_secs),
        }
    }
}

/// One served domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Hand the whole domain to another edge
    #[serde(default)]
    pub redirect: Option<RedirectConfig>,
}

/// Route from a hostname under the domain to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Label joined to the domain; `*` for the wildcard, `@` for the apex
    pub hostname: String,
    /// `tcp://host:port` or `http://host:port`
    pub target: String,
    /// Prefix passthrough dials with a PROXY v1 line
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Only reachable from the internal listener
    #[serde(default)]
    pub internal: bool,
}

impl RouteConfig {
    pub fn pattern(&self, domain: &str) -> Result<HostnamePattern> {
        let domain = normalize(domain);
        match self.hostname.trim() {
            "" | "@" => HostnamePattern::parse(&domain),
            label => HostnamePattern::parse(&format!("{label}.{domain}")),
        }
    }

    pub fn route_target(&self) -> Result<RouteTarget> {
        RouteTarget::parse(&self.target)
    }
}

/// Where a route sends its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Dial `host:port` and splice the raw TLS stream
    Passthrough(String),
    /// Terminate TLS and reverse-proxy HTTP to this base URL
    ReverseProxy(String),
}

impl RouteTarget {
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |why: &str| EdgeError::Config(format!("route target {target}: {why}"));
        let url = url::Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        match url.scheme() {
            "tcp" => Ok(Self::Passthrough(format!("{host}:{port}"))),
            "http" => Ok(Self::ReverseProxy(format!("http://{host}:{port}"))),
            other => Err(invalid(&format!("unsupported scheme {other}"))),
        }
    }
}

/// Forward a domain's TLS and DNS to another edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectConfig {
    pub target: String,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
}

impl RedirectConfig {
    pub fn https_target(&self) -> String {
        format!("{}:{}", self.target, self.https_port)
    }

    pub fn dns_target(&self) -> String {
        format!("udp://{}:{}", self.target, self.dns_port)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_https_addr() -> SocketAddr {
    "[::]:443".parse().unwrap_or_else(|_| ([0, 0, 0, 0], 443).into())
}

fn default_http_addr() -> SocketAddr {
    "[::]:80".parse().unwrap_or_else(|_| ([0, 0, 0, 0], 80).into())
}

fn default_dns_addr() -> SocketAddr {
    "[::]:53".parse().unwrap_or_else(|_| ([0, 0, 0, 0], 53).into())
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_proxy_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    5
}

fn default_recheck_interval() -> u64 {
    86_400
}

fn default_https_port() -> u16 {
    443
}

fn default_dns_port() -> u16 {
    53
}

impl EdgeConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&EdgeConfig::default())?);

        let config_paths = ["edge.toml", "config/edge.toml", "/etc/edge/edge.toml"];
        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("EDGE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(Config::try_from(&EdgeConfig::default())?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("EDGE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        let name = normalize(name);
        self.domains.iter().find(|d| normalize(&d.name) == name)
    }
}

impl ValidateConfig for EdgeConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.server.log_level.as_str()) {
            return Err(ConfigError::Message(format!(
                "server.log_level must be one of: {valid_log_levels:?}"
            )));
        }

        validators::validate_port(self.https.bind_addr.port(), "https.bind_addr")?;
        if let Some(addr) = self.https.internal_bind_addr {
            validators::validate_port(addr.port(), "https.internal_bind_addr")?;
        }
        validators::validate_range(
            self.https.max_connections,
            1,
            100_000,
            "https.max_connections",
        )?;
        for (value, field) in [
            (self.https.client_hello_timeout_secs, "https.client_hello_timeout_secs"),
            (self.https.connect_timeout_secs, "https.connect_timeout_secs"),
            (self.https.handshake_timeout_secs, "https.handshake_timeout_secs"),
            (self.dns.proxy_timeout_secs, "dns.proxy_timeout_secs"),
        ] {
            validators::validate_range(value, 1, 300, field)?;
        }

        if self.http.enabled {
            validators::validate_port(self.http.bind_addr.port(), "http.bind_addr")?;
        }
        if self.dns.enabled {
            validators::validate_port(self.dns.bind_addr.port(), "dns.bind_addr")?;
        }
        validators::validate_range(
            self.dns.refresh_interval_secs,
            1,
            86_400,
            "dns.refresh_interval_secs",
        )?;
        TsigKeyring::new(&self.dns.tsig_keys)
            .map_err(|e| ConfigError::Message(format!("dns.tsig_keys: {e}")))?;

        validators::validate_url(
            &self.acme.directory_url,
            &["https", "http"],
            "acme.directory_url",
        )?;
        for contact in &self.acme.contact {
            if !contact.starts_with("mailto:") {
                return Err(ConfigError::Message(format!(
                    "acme.contact: '{contact}' must be a mailto: URI"
                )));
            }
        }
        validators::validate_range(self.acme.poll_interval_secs, 1, 3600, "acme.poll_interval_secs")?;
        if let Some(max_polls) = self.acme.max_polls {
            validators::validate_range(max_polls, 1, u32::MAX, "acme.max_polls")?;
        }

        validators::validate_range(
            self.certificates.retry_interval_secs,
            1,
            3600,
            "certificates.retry_interval_secs",
        )?;
        if let Some(percent) = self.certificates.renew_after_percent {
            validators::validate_range(percent, 1.0, 100.0, "certificates.renew_after_percent")?;
        }
        validators::validate_range(
            self.certificates.recheck_interval_secs,
            60,
            604_800,
            "certificates.recheck_interval_secs",
        )?;

        let mut seen = HashSet::new();
        for domain in &self.domains {
            validators::validate_dns_name(&domain.name, false, "domains.name")?;
            if !seen.insert(normalize(&domain.name)) {
                return Err(ConfigError::Message(format!(
                    "domains: '{}' is listed twice",
                    domain.name
                )));
            }

            for route in &domain.routes {
                let pattern = route
                    .pattern(&domain.name)
                    .map_err(|e| ConfigError::Message(format!("domains.routes: {e}")))?;
                validators::validate_dns_name(pattern.as_str(), true, "domains.routes.hostname")?;
                route
                    .route_target()
                    .map_err(|e| ConfigError::Message(e.to_string()))?;
            }

            if let Some(redirect) = &domain.redirect {
                validators::validate_not_empty(&redirect.target, "domains.redirect.target")?;
                validators::validate_port(redirect.https_port, "domains.redirect.https_port")?;
                validators::validate_port(redirect.dns_port, "domains.redirect.dns_port")?;
            }
        }

        Ok(())
    }
}
