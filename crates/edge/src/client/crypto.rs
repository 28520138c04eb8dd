//! Key, CSR and certificate helpers for the lifecycle manager

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::common::error::{EdgeError, Result};

/// Fresh ECDSA P-256 key as PKCS#8 PEM
pub fn generate_key_pem() -> Result<String> {
    Ok(KeyPair::generate()?.serialize_pem())
}

/// Build a CSR for `names`, returning `(der, pem)`
///
/// Every name becomes a SAN; the first is also the CN.
pub fn build_csr(names: &[String], key_pem: &str) -> Result<(Vec<u8>, String)> {
    let first = names
        .first()
        .ok_or_else(|| EdgeError::Certificate("CSR needs at least one name".to_string()))?;
    let key = KeyPair::from_pem(key_pem)?;

    let mut params = CertificateParams::new(names.to_vec())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, first.as_str());
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key)?;
    Ok((csr.der().to_vec(), csr.pem()?))
}

pub fn parse_chain_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(EdgeError::Certificate("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

pub fn parse_key_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    Ok(PrivateKeyDer::from_pem_slice(pem.as_bytes())?)
}

/// True when `key_pem` is the private half of the leaf's public key
pub fn key_matches_certificate(key_pem: &str, leaf: &CertificateDer<'_>) -> Result<bool> {
    let key = KeyPair::from_pem(key_pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| EdgeError::Certificate(format!("invalid certificate: {e}")))?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// `(not_before, not_after)` of a certificate
pub fn certificate_validity(cert: &CertificateDer<'_>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| EdgeError::Certificate(format!("invalid certificate: {e}")))?;
    let validity = cert.validity();
    let to_utc = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| EdgeError::Certificate(format!("timestamp {secs} out of range")))
    };
    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}

/// Share of the validity window already elapsed at `now`, in percent
pub fn lifetime_used_percent(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let lifetime = (not_after - not_before).num_seconds();
    if lifetime <= 0 {
        return 100.0;
    }
    let used = (now - not_before).num_seconds();
    #[allow(clippy::cast_precision_loss)]
    let percent = used as f64 * 100.0 / lifetime as f64;
    percent
}
