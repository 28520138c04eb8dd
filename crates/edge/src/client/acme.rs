//! ACME issuance over DNS-01
//!
//! [`AcmeClient`] owns the account and walks a single order through
//! pending, ready and valid. The status loop itself lives in [`drive_order`]
//! and only sees the [`AcmeOrder`] trait, so it can be exercised without a
//! CA.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::tracing::metrics::{Timer, counter, histogram};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeStatus, ChallengeType, Identifier,
    LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tracing::{debug, info, warn};

use crate::common::error::{EdgeError, Result};

/// Default interval between order polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Let's Encrypt production directory
pub fn default_directory_url() -> String {
    LetsEncrypt::Production.url().to_string()
}

/// Publishes DNS-01 values where the CA can see them
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    async fn set_challenge(&self, domain: &str, value: &str) -> Result<()>;
}

/// Something that turns a CSR into a certificate chain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: &CertificateRequest) -> Result<CertificateChain>;
}

/// DNS names plus the DER CSR covering them
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub names: Vec<String>,
    pub csr_der: Vec<u8>,
}

/// A PEM certificate chain, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    pem: String,
}

impl CertificateChain {
    /// Wrap a PEM bundle, rejecting one without certificates
    pub fn from_pem(pem: impl Into<String>) -> Result<Self> {
        let chain = Self { pem: pem.into() };
        chain.certificates()?;
        Ok(chain)
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Decode the chain into DER certificates in bundle order
    pub fn certificates(&self) -> Result<Vec<CertificateDer<'static>>> {
        let certs = CertificateDer::pem_slice_iter(self.pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(EdgeError::Certificate(
                "certificate chain contains no certificates".to_string(),
            ));
        }
        Ok(certs)
    }
}

/// Order status as seen by the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl TryFrom<OrderStatus> for OrderState {
    type Error = EdgeError;

    #[allow(unreachable_patterns)]
    fn try_from(status: OrderStatus) -> Result<Self> {
        match status {
            OrderStatus::Pending => Ok(Self::Pending),
            OrderStatus::Ready => Ok(Self::Ready),
            OrderStatus::Processing => Ok(Self::Processing),
            OrderStatus::Valid => Ok(Self::Valid),
            OrderStatus::Invalid => Ok(Self::Invalid),
            other => Err(EdgeError::Acme(format!(
                "unsupported order status {other:?}"
            ))),
        }
    }
}

/// One in-flight ACME order
#[async_trait]
pub trait AcmeOrder: Send {
    /// Status from the most recent server response
    fn state(&mut self) -> Result<OrderState>;

    /// Re-fetch the order from the CA
    async fn refresh(&mut self) -> Result<OrderState>;

    /// Publish and accept every DNS-01 challenge still pending
    async fn accept_challenges(&mut self, handler: &dyn ChallengeHandler) -> Result<()>;

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()>;

    /// PEM chain once the CA has produced it
    async fn certificate(&mut self) -> Result<Option<String>>;
}

/// How long to keep polling an order
///
/// `max_polls: None` polls until the CA itself expires the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls: None,
        }
    }
}

/// Drive an order to completion and return the PEM chain
///
/// `invalid` and `processing` are treated as transient and re-polled.
pub async fn drive_order(
    order: &mut dyn AcmeOrder,
    challenges: &dyn ChallengeHandler,
    csr_der: &[u8],
    policy: &PollPolicy,
) -> Result<String> {
    let mut state = order.state()?;
    let mut polls: u32 = 0;

    loop {
        debug!(?state, polls, "ACME order status");
        match state {
            OrderState::Pending => {
                order.accept_challenges(challenges).await?;
                tokio::time::sleep(policy.interval).await;
            }
            OrderState::Invalid | OrderState::Processing => {
                tokio::time::sleep(policy.interval).await;
            }
            OrderState::Ready => {
                info!("Finalizing ACME order");
                order.finalize(csr_der).await?;
            }
            OrderState::Valid => match order.certificate().await? {
                Some(pem) => return Ok(pem),
                None => tokio::time::sleep(policy.interval).await,
            },
        }

        polls += 1;
        if let Some(max) = policy.max_polls
            && polls >= max
        {
            return Err(EdgeError::Timeout(format!(
                "ACME order still {state:?} after {polls} polls"
            )));
        }
        state = order.refresh().await?;
    }
}

/// [`AcmeOrder`] backed by an instant-acme order
pub struct InstantAcmeOrder {
    order: Order,
    readied: HashSet<String>,
}

impl InstantAcmeOrder {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            readied: HashSet::new(),
        }
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    fn state(&mut self) -> Result<OrderState> {
        OrderState::try_from(self.order.state().status)
    }

    async fn refresh(&mut self) -> Result<OrderState> {
        let state = self.order.refresh().await?;
        OrderState::try_from(state.status)
    }

    async fn accept_challenges(&mut self, handler: &dyn ChallengeHandler) -> Result<()> {
        let mut authorizations = self.order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;
            if authz.status != AuthorizationStatus::Pending {
                continue;
            }

            let identifier = authz.identifier();
            let domain = match &identifier.identifier {
                Identifier::Dns(domain) => domain.trim_start_matches("*.").to_string(),
                other => {
                    warn!("Skipping non-DNS identifier {:?}", other);
                    continue;
                }
            };

            let Some(mut challenge) = authz.challenge(ChallengeType::Dns01) else {
                return Err(EdgeError::Acme(format!(
                    "no DNS-01 challenge offered for {domain}"
                )));
            };
            if challenge.status != ChallengeStatus::Pending
                || self.readied.contains(&challenge.url)
            {
                continue;
            }

            let value = challenge.key_authorization().dns_value();
            info!(domain = %domain, "Publishing DNS-01 challenge");
            handler.set_challenge(&domain, &value).await?;

            challenge.set_ready().await?;
            self.readied.insert(challenge.url.clone());
        }
        Ok(())
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        self.order.finalize_csr(csr_der).await?;
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        Ok(self.order.certificate().await?)
    }
}

/// ACME client using DNS-01 through a [`ChallengeHandler`]
pub struct AcmeClient {
    directory_url: String,
    contact: Vec<String>,
    account_path: PathBuf,
    account: RwLock<Option<Arc<Account>>>,
    challenges: Arc<dyn ChallengeHandler>,
    policy: PollPolicy,
}

impl AcmeClient {
    /// Create a client whose account credentials live at `account_path`
    pub fn new(
        directory_url: impl Into<String>,
        contact: Vec<String>,
        account_path: impl Into<PathBuf>,
        challenges: Arc<dyn ChallengeHandler>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact,
            account_path: account_path.into(),
            account: RwLock::new(None),
            challenges,
            policy: PollPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Get or create ACME account
    async fn get_or_create_account(&self) -> Result<Arc<Account>> {
        {
            let account_lock = self.account.read().await;
            if let Some(account) = account_lock.as_ref() {
                return Ok(account.clone());
            }
        }

        let account = if tokio::fs::try_exists(&self.account_path).await? {
            debug!("Loading ACME account from {}", self.account_path.display());
            let creds_json = tokio::fs::read_to_string(&self.account_path).await?;
            let creds: AccountCredentials = serde_json::from_str(&creds_json)?;
            Account::builder()?.from_credentials(creds).await?
        } else {
            info!("Registering ACME account at {}", self.directory_url);
            let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
            let (account, creds) = Account::builder()?
                .create(
                    &NewAccount {
                        contact: &contact,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.directory_url.clone(),
                    None,
                )
                .await?;

            if let Some(parent) = self.account_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let creds_json = serde_json::to_string_pretty(&creds)?;
            tokio::fs::write(&self.account_path, creds_json).await?;

            account
        };

        let account = Arc::new(account);
        *self.account.write().await = Some(account.clone());
        Ok(account)
    }

    /// Obtain a chain for the names in `request`
    ///
    /// Any failure aborts the attempt; retrying is up to the caller.
    pub async fn issue_certificate(&self, request: &CertificateRequest) -> Result<CertificateChain> {
        counter("edge_acme_orders_total").increment();
        let _timer = Timer::new(histogram("edge_acme_order_duration_seconds"));
        let result = self.place_order(request).await;
        if let Err(e) = &result {
            counter("edge_acme_failures_total").increment();
            warn!(names = ?request.names, "ACME issuance failed: {}", e);
        }
        result
    }

    async fn place_order(&self, request: &CertificateRequest) -> Result<CertificateChain> {
        let account = self.get_or_create_account().await?;

        let identifiers: Vec<Identifier> = request
            .names
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect();
        info!(names = ?request.names, "Creating ACME order");
        let order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut order = InstantAcmeOrder::new(order);
        let pem = drive_order(
            &mut order,
            self.challenges.as_ref(),
            &request.csr_der,
            &self.policy,
        )
        .await?;

        let chain = CertificateChain::from_pem(pem)?;
        info!(names = ?request.names, "ACME order completed");
        Ok(chain)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(&self, request: &CertificateRequest) -> Result<CertificateChain> {
        self.issue_certificate(request).await
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("account_path", &self.account_path)
            .finish_non_exhaustive()
    }
}
