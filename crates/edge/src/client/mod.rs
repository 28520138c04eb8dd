//! Certificate acquisition and lifecycle

pub mod acme;
pub mod certificate_manager;
pub mod crypto;

#[cfg(test)]
pub(crate) mod test_support;

pub use acme::{AcmeClient, CertificateChain, CertificateIssuer, CertificateRequest, ChallengeHandler};
pub use certificate_manager::{CertificateManager, CertificateStatus, LifecyclePolicy};
