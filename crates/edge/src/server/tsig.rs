//! TSIG (RFC 8945) verification of queries and signing of replies

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hickory_proto::op::Message;
use hickory_proto::rr::dnssec::rdata::tsig::{TSIG, TsigAlgorithm, make_tsig_record, message_tbs};
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::{Name, RecordType};
use serde::{Deserialize, Serialize};

use crate::common::error::{EdgeError, Result};
use crate::common::hostname::normalize;

/// Allowed clock skew for signed messages, in seconds
pub const DEFAULT_FUDGE: u16 = 300;

/// A shared TSIG secret as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsigKeyConfig {
    /// Key name, e.g. `acme-update.`
    pub name: String,
    /// Base64 secret
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

fn default_algorithm() -> String {
    "hmac-sha256".to_string()
}

/// Result of checking a query's signature
#[derive(Debug)]
pub enum TsigVerification {
    /// The query carried no TSIG record
    Unsigned,
    /// Signature valid; the reply should be signed with the same key
    Verified { key: String, request_mac: Vec<u8> },
    /// Signed, but the signature could not be verified
    Failed(String),
}

/// Configured TSIG keys by name
#[derive(Default)]
pub struct TsigKeyring {
    signers: HashMap<String, TSigner>,
}

impl TsigKeyring {
    pub fn new(keys: &[TsigKeyConfig]) -> Result<Self> {
        let mut signers = HashMap::new();
        for key in keys {
            let secret = STANDARD
                .decode(key.secret.trim())
                .map_err(|e| EdgeError::Config(format!("TSIG key {}: {e}", key.name)))?;
            let algorithm = parse_algorithm(&key.algorithm)?;
            let name = Name::from_ascii(&key.name)?;
            let signer = TSigner::new(secret, algorithm, name, DEFAULT_FUDGE)?;
            signers.insert(normalize(&key.name), signer);
        }
        Ok(Self { signers })
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    /// Check the TSIG record of a parsed query against its raw bytes
    pub fn verify(&self, request: &Message, raw: &[u8]) -> TsigVerification {
        let Some(record) = request
            .signature()
            .iter()
            .find(|r| r.record_type() == RecordType::TSIG)
        else {
            return TsigVerification::Unsigned;
        };

        let key = normalize(&record.name().to_ascii());
        let Some(signer) = self.signers.get(&key) else {
            return TsigVerification::Failed(format!("unknown key {key}"));
        };

        match signer.verify_message_byte(None, raw, true) {
            Ok((request_mac, valid_window, _signed_at)) => {
                if valid_window.contains(&unix_now()) {
                    TsigVerification::Verified { key, request_mac }
                } else {
                    TsigVerification::Failed(format!("signature by {key} outside time window"))
                }
            }
            Err(e) => TsigVerification::Failed(format!("bad signature by {key}: {e}")),
        }
    }

    /// Append a TSIG record to a reply, chaining the query's MAC
    pub fn sign(&self, response: &mut Message, key: &str, request_mac: &[u8]) -> Result<()> {
        let signer = self
            .signers
            .get(key)
            .ok_or_else(|| EdgeError::Config(format!("unknown TSIG key {key}")))?;

        let pre_tsig = TSIG::new(
            signer.algorithm().clone(),
            unix_now(),
            signer.fudge(),
            Vec::new(),
            response.id(),
            0,
            Vec::new(),
        );
        let tbs = message_tbs(Some(request_mac), &*response, &pre_tsig, signer.signer_name())?;
        let mac = signer.sign(&tbs)?;
        response.add_tsig(make_tsig_record(
            signer.signer_name().clone(),
            pre_tsig.set_mac(mac),
        ));
        Ok(())
    }
}

impl std::fmt::Debug for TsigKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsigKeyring")
            .field("keys", &self.signers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn parse_algorithm(name: &str) -> Result<TsigAlgorithm> {
    match name.to_ascii_lowercase().trim_end_matches('.') {
        "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
        "hmac-sha384" => Ok(TsigAlgorithm::HmacSha384),
        "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
        other => Err(EdgeError::Config(format!(
            "unsupported TSIG algorithm {other}"
        ))),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};

    const SECRET: &str = "c2VjcmV0LWtleS1mb3ItdGVzdGluZy10c2lnLXNpZ25pbmc=";

    fn keyring(secret: &str) -> TsigKeyring {
        TsigKeyring::new(&[TsigKeyConfig {
            name: "update-key.".into(),
            secret: secret.into(),
            algorithm: "hmac-sha256".into(),
        }])
        .unwrap()
    }

    fn signed_query(secret: &str) -> Vec<u8> {
        let signer = TSigner::new(
            STANDARD.decode(secret).unwrap(),
            TsigAlgorithm::HmacSha256,
            Name::from_ascii("update-key.").unwrap(),
            DEFAULT_FUDGE,
        )
        .unwrap();

        let mut query = Message::new();
        query
            .set_id(4242)
            .add_query(Query::query(
                Name::from_ascii("_acme-challenge.example.com.").unwrap(),
                RecordType::TXT,
            ));
        query.finalize(&signer, unix_now() as u32).unwrap();
        query.to_vec().unwrap()
    }

    #[test]
    fn test_unsigned_query() {
        let mut query = Message::new();
        query.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        let raw = query.to_vec().unwrap();
        let parsed = Message::from_vec(&raw).unwrap();
        assert!(matches!(
            keyring(SECRET).verify(&parsed, &raw),
            TsigVerification::Unsigned
        ));
    }

    #[test]
    fn test_verify_and_sign_reply() {
        let raw = signed_query(SECRET);
        let request = Message::from_vec(&raw).unwrap();
        let keys = keyring(SECRET);

        let TsigVerification::Verified { key, request_mac } = keys.verify(&request, &raw) else {
            panic!("signature not accepted");
        };
        assert_eq!(key, "update-key");

        let mut reply = Message::new();
        reply.set_id(request.id()).set_message_type(MessageType::Response);
        keys.sign(&mut reply, &key, &request_mac).unwrap();
        let reply = Message::from_vec(&reply.to_vec().unwrap()).unwrap();
        assert_eq!(reply.signature().len(), 1);
        assert_eq!(reply.signature()[0].record_type(), RecordType::TSIG);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let raw = signed_query("b3RoZXItc2VjcmV0LW90aGVyLXNlY3JldA==");
        let request = Message::from_vec(&raw).unwrap();
        assert!(matches!(
            keyring(SECRET).verify(&request, &raw),
            TsigVerification::Failed(_)
        ));
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let result = TsigKeyring::new(&[TsigKeyConfig {
            name: "k.".into(),
            secret: SECRET.into(),
            algorithm: "hmac-md5".into(),
        }]);
        assert!(result.is_err());
    }
}
