//! Certificate lifecycle for the domains the edge serves
//!
//! Each domain keeps a current key/certificate pair and, while an issuance
//! is in flight, a staging key, CSR and certificate next to it:
//!
//! ```text
//! <certs>/<domain>/<domain>.key.pem
//! <certs>/<domain>/<domain>.cert.pem
//! <certs>/<domain>/<domain>.new-key.pem
//! <certs>/<domain>/<domain>.new-csr.pem
//! <certs>/<domain>/<domain>.new-cert.pem
//! ```
//!
//! Staging files are promoted by rename, certificate first. A current key
//! that does not belong to the current certificate counts as missing, so a
//! crash between the two renames ends in a fresh issuance using the staging
//! key that is still on disk.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::acme::{CertificateIssuer, CertificateRequest};
use super::crypto;
use crate::common::error::{EdgeError, Result};
use crate::common::hostname::{HostnamePattern, normalize};
use crate::server::router::SniRouter;

/// Receives certificates as they are loaded or issued
#[async_trait]
pub trait CertificateSink: Send + Sync {
    async fn install(
        &self,
        pattern: &HostnamePattern,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<()>;
}

#[async_trait]
impl CertificateSink for SniRouter {
    async fn install(
        &self,
        pattern: &HostnamePattern,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<()> {
        self.install_certificate(pattern, chain, key).await
    }
}

/// Per-domain certificate state, as reported on `/health`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CertificateStatus {
    Missing,
    Issuing,
    Installed {
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        lifetime_used_percent: f64,
    },
    Failed {
        error: String,
    },
}

/// Retry and renewal timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecyclePolicy {
    /// Back-off after a failed load or issuance
    pub retry_interval: Duration,
    /// Re-issue once this share of the lifetime is used; `None` never renews
    pub renew_after_percent: Option<f64>,
    /// How often an installed certificate is re-checked for renewal
    pub recheck_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            renew_after_percent: None,
            recheck_interval: Duration::from_secs(86_400),
        }
    }
}

/// A private key with the chain it belongs to
#[derive(Debug, Clone)]
pub struct CertifiedPair {
    pub key_pem: String,
    pub chain: Vec<CertificateDer<'static>>,
}

impl CertifiedPair {
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        crypto::parse_key_pem(&self.key_pem)
    }

    /// Leaf certificate
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }
}

/// Current and staging file locations for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub new_key: PathBuf,
    pub new_csr: PathBuf,
    pub new_cert: PathBuf,
}

impl CertificateFiles {
    pub fn for_domain(cert_dir: &Path, domain: &str) -> Self {
        let dir = cert_dir.join(domain);
        let file = |suffix: &str| dir.join(format!("{domain}.{suffix}.pem"));
        Self {
            key: file("key"),
            cert: file("cert"),
            new_key: file("new-key"),
            new_csr: file("new-csr"),
            new_cert: file("new-cert"),
        }
    }

    fn dir(&self) -> Option<&Path> {
        self.key.parent()
    }
}

struct ManagedDomain {
    names: Vec<String>,
    pattern: HostnamePattern,
    files: CertificateFiles,
    status: CertificateStatus,
    current: Option<Arc<CertifiedPair>>,
}

/// Keeps one valid key/chain pair per domain on disk and in the router
pub struct CertificateManager {
    cert_dir: PathBuf,
    issuer: Arc<dyn CertificateIssuer>,
    sink: Arc<dyn CertificateSink>,
    policy: LifecyclePolicy,
    domains: RwLock<HashMap<String, ManagedDomain>>,
}

impl CertificateManager {
    /// Create a new certificate manager storing pairs under `cert_dir`
    pub fn new(
        cert_dir: impl Into<PathBuf>,
        issuer: Arc<dyn CertificateIssuer>,
        sink: Arc<dyn CertificateSink>,
    ) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            issuer,
            sink,
            policy: LifecyclePolicy::default(),
            domains: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Start tracking `domain`; its certificate covers `*.<domain>`
    pub async fn register(&self, domain: &str) -> Result<()> {
        let domain = normalize(domain);
        let pattern = HostnamePattern::wildcard(&domain)?;
        let files = CertificateFiles::for_domain(&self.cert_dir, &domain);
        let mut domains = self.domains.write().await;
        domains.entry(domain).or_insert_with(|| ManagedDomain {
            names: vec![pattern.to_string()],
            pattern,
            files,
            status: CertificateStatus::Missing,
            current: None,
        });
        Ok(())
    }

    /// Stop tracking `domain`; files on disk are kept
    pub async fn unregister(&self, domain: &str) {
        self.domains.write().await.remove(&normalize(domain));
    }

    pub async fn status(&self, domain: &str) -> Option<CertificateStatus> {
        self.domains
            .read()
            .await
            .get(&normalize(domain))
            .map(|d| d.status.clone())
    }

    /// Status of every tracked domain
    pub async fn statuses(&self) -> BTreeMap<String, CertificateStatus> {
        self.domains
            .read()
            .await
            .iter()
            .map(|(name, d)| (name.clone(), d.status.clone()))
            .collect()
    }

    /// The installed key and chain, for TLS backends outside the router
    pub async fn get_certificate_and_key(&self, domain: &str) -> Option<Arc<CertifiedPair>> {
        self.domains
            .read()
            .await
            .get(&normalize(domain))
            .and_then(|d| d.current.clone())
    }

    /// Make sure `domain` has a current pair installed
    ///
    /// A loadable current pair short-circuits issuance unless the renewal
    /// threshold has been crossed.
    #[instrument(name = "certificate.ensure", skip(self))]
    pub async fn ensure_certificate(&self, domain: &str) -> Result<CertificateStatus> {
        let domain = normalize(domain);
        let (names, pattern, files) = {
            let domains = self.domains.read().await;
            let managed = domains
                .get(&domain)
                .ok_or_else(|| EdgeError::Config(format!("domain {domain} is not registered")))?;
            (
                managed.names.clone(),
                managed.pattern.clone(),
                managed.files.clone(),
            )
        };

        let loaded = match load_pair(&files).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.set_failed(&domain, &e).await;
                return Err(e);
            }
        };

        if let Some(pair) = loaded {
            let status = self.install(&domain, &pattern, pair).await?;
            match (&status, self.policy.renew_after_percent) {
                (
                    CertificateStatus::Installed {
                        lifetime_used_percent,
                        ..
                    },
                    Some(threshold),
                ) if *lifetime_used_percent >= threshold => {
                    info!(
                        "Certificate for {} has used {:.2}% of its lifetime, renewing",
                        domain, lifetime_used_percent
                    );
                }
                _ => return Ok(status),
            }
        }

        self.set_status(&domain, CertificateStatus::Issuing).await;
        if let Err(e) = self.create(&names, &files).await {
            self.set_failed(&domain, &e).await;
            return Err(e);
        }

        let pair = load_pair(&files).await?.ok_or_else(|| {
            EdgeError::Certificate(format!("issued certificate for {domain} did not load"))
        })?;
        self.install(&domain, &pattern, pair).await
    }

    /// Keep `domain` supplied until `shutdown` fires
    ///
    /// Without a renewal threshold the loop ends once a pair is installed.
    pub async fn run(self: Arc<Self>, domain: String, shutdown: CancellationToken) {
        loop {
            let wait = match self.ensure_certificate(&domain).await {
                Ok(_) if self.policy.renew_after_percent.is_none() => {
                    debug!("Certificate for {} installed, loop idle", domain);
                    return;
                }
                Ok(_) => self.policy.recheck_interval,
                Err(e) => {
                    warn!("Certificate for {} not ready: {}", domain, e);
                    self.policy.retry_interval
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
            if !self.domains.read().await.contains_key(&domain) {
                return;
            }
        }
    }

    async fn install(
        &self,
        domain: &str,
        pattern: &HostnamePattern,
        pair: CertifiedPair,
    ) -> Result<CertificateStatus> {
        let leaf = pair
            .leaf()
            .ok_or_else(|| EdgeError::Certificate("empty chain".to_string()))?;
        let (not_before, not_after) = crypto::certificate_validity(leaf)?;
        let status = CertificateStatus::Installed {
            not_before,
            not_after,
            lifetime_used_percent: crypto::lifetime_used_percent(
                not_before,
                not_after,
                Utc::now(),
            ),
        };

        // Held across the sink update so unregister() cannot interleave
        let mut domains = self.domains.write().await;
        let Some(managed) = domains.get_mut(domain) else {
            debug!("Domain {} unregistered, dropping its certificate", domain);
            return Err(EdgeError::Config(format!("domain {domain} is not registered")));
        };

        let unchanged = managed
            .current
            .as_ref()
            .is_some_and(|current| current.chain == pair.chain && current.key_pem == pair.key_pem);
        if !unchanged {
            self.sink
                .install(pattern, pair.chain.clone(), pair.private_key()?)
                .await?;
            info!("Certificate for {} valid until {}", domain, not_after);
        }

        managed.current = Some(Arc::new(pair));
        managed.status = status.clone();
        Ok(status)
    }

    async fn create(&self, names: &[String], files: &CertificateFiles) -> Result<()> {
        if let Some(dir) = files.dir() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let key_pem = match tokio::fs::read_to_string(&files.new_key).await {
            Ok(pem) => {
                debug!("Reusing staging key {}", files.new_key.display());
                pem
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let pem = crypto::generate_key_pem()?;
                tokio::fs::write(&files.new_key, &pem).await?;
                pem
            }
            Err(e) => return Err(e.into()),
        };

        let (csr_der, csr_pem) = crypto::build_csr(names, &key_pem)?;
        tokio::fs::write(&files.new_csr, csr_pem).await?;

        let chain = self
            .issuer
            .issue(&CertificateRequest {
                names: names.to_vec(),
                csr_der,
            })
            .await?;

        tokio::fs::write(&files.new_cert, chain.pem()).await?;
        tokio::fs::rename(&files.new_cert, &files.cert).await?;
        tokio::fs::rename(&files.new_key, &files.key).await?;
        tokio::fs::remove_file(&files.new_csr).await?;
        Ok(())
    }

    async fn set_status(&self, domain: &str, status: CertificateStatus) {
        if let Some(managed) = self.domains.write().await.get_mut(domain) {
            managed.status = status;
        }
    }

    /// Record a failure without hiding a certificate that is still installed
    async fn set_failed(&self, domain: &str, error: &EdgeError) {
        if let Some(managed) = self.domains.write().await.get_mut(domain)
            && managed.current.is_none()
        {
            managed.status = CertificateStatus::Failed {
                error: error.to_string(),
            };
        }
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cert_dir", &self.cert_dir)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Read the current pair; `None` means it has to be issued
async fn load_pair(files: &CertificateFiles) -> Result<Option<CertifiedPair>> {
    let key_pem = match tokio::fs::read_to_string(&files.key).await {
        Ok(pem) => pem,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let cert_pem = match tokio::fs::read_to_string(&files.cert).await {
        Ok(pem) => pem,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("{} exists without a certificate", files.key.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let chain = match crypto::parse_chain_pem(&cert_pem) {
        Ok(chain) => chain,
        Err(e) => {
            warn!("Unreadable certificate {}: {}", files.cert.display(), e);
            return Ok(None);
        }
    };
    match crypto::key_matches_certificate(&key_pem, &chain[0]) {
        Ok(true) => Ok(Some(CertifiedPair { key_pem, chain })),
        Ok(false) => {
            warn!(
                "{} does not belong to {}, reissuing",
                files.key.display(),
                files.cert.display()
            );
            Ok(None)
        }
        Err(e) => {
            warn!("Unreadable key pair {}: {}", files.key.display(), e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::TestCa;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        installed: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl CertificateSink for RecordingSink {
        async fn install(
            &self,
            pattern: &HostnamePattern,
            chain: Vec<CertificateDer<'static>>,
            _key: PrivateKeyDer<'static>,
        ) -> Result<()> {
            assert_eq!(chain.len(), 2);
            self.installed.lock().unwrap().push(pattern.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        ca: Arc<TestCa>,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                ca: Arc::new(TestCa::new()),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        async fn manager(&self, policy: LifecyclePolicy) -> CertificateManager {
            let manager =
                CertificateManager::new(self.dir.path(), self.ca.clone(), self.sink.clone())
                    .with_policy(policy);
            manager.register("example.com").await.unwrap();
            manager
        }

        fn files(&self) -> CertificateFiles {
            CertificateFiles::for_domain(self.dir.path(), "example.com")
        }
    }

    #[test]
    fn test_file_layout() {
        let files = CertificateFiles::for_domain(Path::new("/state/certs"), "example.com");
        assert_eq!(
            files.key,
            PathBuf::from("/state/certs/example.com/example.com.key.pem")
        );
        assert_eq!(
            files.new_csr,
            PathBuf::from("/state/certs/example.com/example.com.new-csr.pem")
        );
    }

    #[tokio::test]
    async fn test_missing_certificate_is_issued_and_installed() {
        let fx = Fixture::new();
        let manager = fx.manager(LifecyclePolicy::default()).await;
        assert_eq!(
            manager.status("example.com").await,
            Some(CertificateStatus::Missing)
        );

        let status = manager.ensure_certificate("example.com").await.unwrap();
        assert!(matches!(status, CertificateStatus::Installed { .. }));

        let files = fx.files();
        assert!(files.key.exists());
        assert!(files.cert.exists());
        assert!(!files.new_key.exists());
        assert!(!files.new_csr.exists());
        assert!(!files.new_cert.exists());

        assert_eq!(
            *fx.ca.requests.lock().unwrap(),
            vec![vec!["*.example.com".to_string()]]
        );
        assert_eq!(
            *fx.sink.installed.lock().unwrap(),
            vec!["*.example.com".to_string()]
        );

        let pair = manager.get_certificate_and_key("example.com").await.unwrap();
        assert!(crypto::key_matches_certificate(&pair.key_pem, pair.leaf().unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_existing_certificate_short_circuits_issuance() {
        let fx = Fixture::new();
        let manager = fx.manager(LifecyclePolicy::default()).await;
        manager.ensure_certificate("example.com").await.unwrap();
        manager.ensure_certificate("example.com").await.unwrap();
        assert_eq!(fx.ca.issued(), 1);
        assert_eq!(fx.sink.count.load(Ordering::SeqCst), 1);

        // A restarted process loads the same pair
        let restarted = fx.manager(LifecyclePolicy::default()).await;
        restarted.ensure_certificate("example.com").await.unwrap();
        assert_eq!(fx.ca.issued(), 1);
        assert_eq!(fx.sink.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crash_between_renames_reissues() {
        let fx = Fixture::new();
        let manager = fx.manager(LifecyclePolicy::default()).await;
        manager.ensure_certificate("example.com").await.unwrap();
        let files = fx.files();

        // New certificate promoted, key rename never happened
        let staging_key = crypto::generate_key_pem().unwrap();
        std::fs::write(&files.new_key, &staging_key).unwrap();
        let (csr_der, _) = crypto::build_csr(&["*.example.com".to_string()], &staging_key).unwrap();
        let chain = fx
            .ca
            .issue(&CertificateRequest {
                names: vec!["*.example.com".to_string()],
                csr_der,
            })
            .await
            .unwrap();
        std::fs::write(&files.cert, chain.pem()).unwrap();
        let issued_before = fx.ca.issued();

        let restarted = fx.manager(LifecyclePolicy::default()).await;
        restarted.ensure_certificate("example.com").await.unwrap();

        assert_eq!(fx.ca.issued(), issued_before + 1);
        let key = std::fs::read_to_string(&files.key).unwrap();
        assert_eq!(key, staging_key);
        let cert = std::fs::read_to_string(&files.cert).unwrap();
        let chain = crypto::parse_chain_pem(&cert).unwrap();
        assert!(crypto::key_matches_certificate(&key, &chain[0]).unwrap());
        assert!(!files.new_key.exists());
    }

    #[tokio::test]
    async fn test_failed_issuance_leaves_no_current_pair() {
        let fx = Fixture::new();
        fx.ca.set_failing(true);
        let manager = fx.manager(LifecyclePolicy::default()).await;

        assert!(manager.ensure_certificate("example.com").await.is_err());
        assert!(matches!(
            manager.status("example.com").await,
            Some(CertificateStatus::Failed { .. })
        ));
        let files = fx.files();
        assert!(!files.key.exists());
        assert!(!files.cert.exists());
        let staged = std::fs::read_to_string(&files.new_key).unwrap();

        fx.ca.set_failing(false);
        manager.ensure_certificate("example.com").await.unwrap();
        assert_eq!(std::fs::read_to_string(&files.key).unwrap(), staged);
    }

    #[tokio::test]
    async fn test_renewal_threshold() {
        let fx = Fixture::new();
        let lenient = LifecyclePolicy {
            renew_after_percent: Some(90.0),
            ..LifecyclePolicy::default()
        };
        let manager = fx.manager(lenient).await;
        manager.ensure_certificate("example.com").await.unwrap();
        manager.ensure_certificate("example.com").await.unwrap();
        assert_eq!(fx.ca.issued(), 1);

        // Test certificates start in 1975, so any recent date is past 0%
        let eager = LifecyclePolicy {
            renew_after_percent: Some(0.0),
            ..LifecyclePolicy::default()
        };
        let manager = fx.manager(eager).await;
        manager.ensure_certificate("example.com").await.unwrap();
        assert_eq!(fx.ca.issued(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_domain_is_an_error() {
        let fx = Fixture::new();
        let manager = fx.manager(LifecyclePolicy::default()).await;
        assert!(manager.ensure_certificate("other.org").await.is_err());
        assert!(manager.status("other.org").await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_during_issuance_skips_sink() {
        let fx = Fixture {
            ca: Arc::new(TestCa::new().with_delay(Duration::from_millis(200))),
            ..Fixture::new()
        };
        let manager = Arc::new(fx.manager(LifecyclePolicy::default()).await);

        let issuing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_certificate("example.com").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.unregister("example.com").await;

        assert!(issuing.await.unwrap().is_err());
        assert_eq!(fx.ca.issued(), 1);
        assert_eq!(fx.sink.count.load(Ordering::SeqCst), 0);
        assert!(manager.status("example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_run_retries_until_installed() {
        let fx = Fixture::new();
        fx.ca.set_failing(true);
        let manager = Arc::new(
            fx.manager(LifecyclePolicy {
                retry_interval: Duration::from_millis(20),
                ..LifecyclePolicy::default()
            })
            .await,
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            manager
                .clone()
                .run("example.com".to_string(), shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.ca.set_failing(false);

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("loop should finish once installed")
            .unwrap();
        assert!(matches!(
            manager.status("example.com").await,
            Some(CertificateStatus::Installed { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = Fixture::new();
        fx.ca.set_failing(true);
        let manager = Arc::new(fx.manager(LifecyclePolicy::default()).await);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.run("example.com".to_string(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(CertificateStatus::Failed {
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
