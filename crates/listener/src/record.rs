//! Certificate records and storage slots.
//!
//! A [`CertificateRecord`] is immutable: renewal or new SAN requirements
//! always produce a new record. The rustls [`CertifiedKey`] is built once at
//! construction so the handshake path only clones an `Arc`.

use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use x509_parser::extensions::{GeneralName, ParsedExtension};

use certmesh_common::WriterId;

use crate::errors::RecordError;
use crate::identity::SanSet;

/// A leaf certificate with its private key and parsed metadata
#[derive(Clone)]
pub struct CertificateRecord {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    sans: SanSet,
    common_name: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    issuer: String,
    authority_key_id: Option<Vec<u8>>,
    fingerprint: String,
    certified_key: Arc<CertifiedKey>,
}

impl CertificateRecord {
    /// Build a record from PEM certificate and key material.
    ///
    /// Only the first certificate of `cert_pem` (the leaf) is served.
    pub fn from_pem(
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let cert_pem = cert_pem.into();
        let key_pem = key_pem.into();

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or(RecordError::NoCertificate)??;

        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
            .ok_or(RecordError::NoPrivateKey)?;

        let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
            .map_err(|e| RecordError::X509(e.to_string()))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| RecordError::X509("not-before out of range".to_string()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| RecordError::X509("not-after out of range".to_string()))?;

        let mut sans = SanSet::new();
        if let Some(extension) = cert
            .subject_alternative_name()
            .map_err(|e| RecordError::X509(e.to_string()))?
        {
            for name in &extension.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        sans.insert(dns);
                    }
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            sans.insert(&ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let issuer = cert.issuer().to_string();
        let authority_key_id = cert.extensions().iter().find_map(|ext| {
            match ext.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    aki.key_identifier.as_ref().map(|id| id.0.to_vec())
                }
                _ => None,
            }
        });
        let fingerprint = hex::encode(Sha256::digest(cert_der.as_ref()));

        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        let signing_key = provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| RecordError::Key(e.to_string()))?;
        let certified_key = Arc::new(CertifiedKey::new(vec![cert_der.clone()], signing_key));

        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            sans,
            common_name,
            not_before,
            not_after,
            issuer,
            authority_key_id,
            fingerprint,
            certified_key,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn sans(&self) -> &SanSet {
        &self.sans
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Issuer distinguished name as rendered by x509-parser
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key identifier of the issuing CA, when the leaf carries one
    pub fn authority_key_id(&self) -> Option<&[u8]> {
        self.authority_key_id.as_deref()
    }

    /// Hex SHA-256 of the leaf DER
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

impl PartialEq for CertificateRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cert_der == other.cert_der && self.key_pem == other.key_pem
    }
}

impl Eq for CertificateRecord {}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("common_name", &self.common_name)
            .field("sans", &self.sans)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("issuer", &self.issuer)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// One record at one revision.
///
/// Revision 0 means the slot is absent; the first successful write
/// produces revision 1.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSlot {
    pub revision: u64,
    pub record: Arc<CertificateRecord>,
    pub written_by: WriterId,
    pub updated_at: DateTime<Utc>,
}

impl StorageSlot {
    pub fn to_document(&self) -> SlotDocument {
        SlotDocument {
            revision: self.revision,
            certificate: self.record.cert_pem().to_string(),
            key: self.record.key_pem().to_string(),
            written_by: self.written_by.clone(),
            updated_at: self.updated_at,
        }
    }

    pub fn from_document(document: SlotDocument) -> Result<Self, RecordError> {
        let record = CertificateRecord::from_pem(document.certificate, document.key)?;
        Ok(Self {
            revision: document.revision,
            record: Arc::new(record),
            written_by: document.written_by,
            updated_at: document.updated_at,
        })
    }
}

/// Persisted form of a [`StorageSlot`], shared by the file tier and the
/// durable backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlotDocument {
    pub revision: u64,
    /// PEM leaf certificate
    pub certificate: String,
    /// PEM private key
    pub key: String,
    pub written_by: WriterId,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::factory::CertificateFactory;
    use crate::identity::RequiredIdentity;
    use std::time::Duration;

    fn generate(sans: &[&str]) -> CertificateRecord {
        let ca = Arc::new(CertificateAuthority::generate_self_signed("Record Test CA").unwrap());
        let factory = CertificateFactory::new(ca, Duration::from_secs(86400));
        let identity = RequiredIdentity::new("node1", "certmesh", sans.iter().collect());
        factory.generate_leaf(&identity).unwrap()
    }

    #[test]
    fn test_parses_generated_record() {
        let record = generate(&["localhost", "Node1.Cluster.Local", "10.0.0.5", "::1"]);

        assert_eq!(
            record.sans().to_vec(),
            vec!["10.0.0.5", "::1", "localhost", "node1.cluster.local"]
        );
        assert_eq!(record.common_name(), Some("node1"));
        assert!(record.issuer().contains("Record Test CA"));
        assert_eq!(record.fingerprint().len(), 64);
        assert!(record.not_after() > record.not_before());
    }

    #[test]
    fn test_debug_hides_key() {
        let record = generate(&["localhost"]);
        let debug = format!("{:?}", record);
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("localhost"));
    }

    #[test]
    fn test_rejects_missing_key() {
        let record = generate(&["localhost"]);
        let err = CertificateRecord::from_pem(record.cert_pem(), "").unwrap_err();
        assert!(matches!(err, RecordError::NoPrivateKey));

        let err = CertificateRecord::from_pem("garbage", record.key_pem()).unwrap_err();
        assert!(matches!(err, RecordError::NoCertificate));
    }

    #[test]
    fn test_document_roundtrip_preserves_record() {
        let slot = StorageSlot {
            revision: 3,
            record: Arc::new(generate(&["localhost"])),
            written_by: WriterId::from_string("node-a"),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string(&slot.to_document()).unwrap();
        assert!(json.contains("\"written-by\":\"node-a\""));

        let document: SlotDocument = serde_json::from_str(&json).unwrap();
        let back = StorageSlot::from_document(document).unwrap();
        assert_eq!(back.revision, 3);
        assert_eq!(back.record, slot.record);
    }
}
