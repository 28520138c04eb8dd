//! Throwaway CA standing in for an ACME server in tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, CertificateSigningRequestParams, IsCa, KeyPair};

use super::acme::{CertificateChain, CertificateIssuer, CertificateRequest};
use crate::common::error::{EdgeError, Result};

/// Signs every CSR it is given; can be switched into a failing mode
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
    pub requests: Mutex<Vec<Vec<String>>>,
    pub failing: AtomicBool,
    delay: Duration,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert,
            key,
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    /// Sleep before signing, like a CA that takes a while to validate
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of certificates issued so far
    pub fn issued(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }
}

#[async_trait]
impl CertificateIssuer for TestCa {
    async fn issue(&self, request: &CertificateRequest) -> Result<CertificateChain> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EdgeError::Acme("order invalid".to_string()));
        }
        self.requests.lock().unwrap().push(request.names.clone());
        let csr = CertificateSigningRequestParams::from_der(&request.csr_der.clone().into())?;
        let leaf = csr.signed_by(&self.cert, &self.key)?;
        CertificateChain::from_pem(format!("{}{}", leaf.pem(), self.cert.pem()))
    }
}
