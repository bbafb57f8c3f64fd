//! Certificate authority used to sign serving certificates.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::info;
use x509_parser::extensions::ParsedExtension;

use crate::errors::SigningError;

/// Validity of CAs created by [`CertificateAuthority::generate_self_signed`]
const GENERATED_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 86400);

/// CA certificate and signing key
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    subject: String,
    key_id: Option<Vec<u8>>,
}

impl CertificateAuthority {
    /// Load a CA from PEM certificate and key.
    ///
    /// Fails when the key does not parse or the certificate is not a CA.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SigningError> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| SigningError::InvalidCa("no certificate in CA PEM".to_string()))?
            .map_err(|e| SigningError::InvalidCa(format!("unreadable CA PEM: {}", e)))?;

        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| SigningError::InvalidCa(format!("unreadable CA key: {}", e)))?;

        let (subject, key_id) = inspect_ca(&cert_der)?;

        let issuer = Issuer::from_ca_cert_der(&cert_der, key)
            .map_err(|e| SigningError::InvalidCa(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
            issuer,
            subject,
            key_id,
        })
    }

    pub fn from_pem_files(cert_file: &Path, key_file: &Path) -> Result<Self, SigningError> {
        let cert_pem = std::fs::read_to_string(cert_file).map_err(|e| {
            SigningError::InvalidCa(format!("cannot read {}: {}", cert_file.display(), e))
        })?;
        let key_pem = std::fs::read_to_string(key_file).map_err(|e| {
            SigningError::InvalidCa(format!("cannot read {}: {}", key_file.display(), e))
        })?;

        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            cert_file = %cert_file.display(),
            subject = %ca.subject,
            "Loaded certificate authority"
        );
        Ok(ca)
    }

    /// Create a fresh self-signed CA, for development clusters and tests
    pub fn generate_self_signed(common_name: &str) -> Result<Self, SigningError> {
        let key = KeyPair::generate().map_err(|e| SigningError::Signing(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + GENERATED_CA_VALIDITY).into();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);
        distinguished_name.push(DnType::OrganizationName, "certmesh");
        params.distinguished_name = distinguished_name;

        let cert = params
            .self_signed(&key)
            .map_err(|e| SigningError::Signing(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key.serialize_pem())
    }

    /// Write the certificate and key; the key file is created with mode 0600
    pub fn write_pem_files(&self, cert_file: &Path, key_file: &Path) -> std::io::Result<()> {
        for path in [cert_file, key_file] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        std::fs::write(cert_file, &self.cert_pem)?;
        std::fs::write(key_file, &self.key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_file, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(
            cert_file = %cert_file.display(),
            key_file = %key_file.display(),
            "Wrote certificate authority"
        );
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Subject DN, compared against the issuer DN of leaf records
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Subject key identifier, compared against the leaf's authority key id
    pub fn key_id(&self) -> Option<&[u8]> {
        self.key_id.as_deref()
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

fn inspect_ca(cert_der: &CertificateDer<'_>) -> Result<(String, Option<Vec<u8>>), SigningError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|e| SigningError::InvalidCa(format!("invalid CA certificate: {}", e)))?;

    if !cert.is_ca() {
        return Err(SigningError::InvalidCa(
            "certificate is not a CA (basicConstraints CA:FALSE)".to_string(),
        ));
    }

    let key_id = cert
        .extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
            _ => None,
        });

    Ok((cert.subject().to_string(), key_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_reload() {
        let ca = CertificateAuthority::generate_self_signed("Test CA").unwrap();
        assert!(ca.subject().contains("Test CA"));

        let dir = TempDir::new().unwrap();
        let cert_file = dir.path().join("ca/server-ca.crt");
        let key_file = dir.path().join("ca/server-ca.key");
        ca.write_pem_files(&cert_file, &key_file).unwrap();

        let reloaded = CertificateAuthority::from_pem_files(&cert_file, &key_file).unwrap();
        assert_eq!(reloaded.subject(), ca.subject());
        assert_eq!(reloaded.cert_der(), ca.cert_der());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_rejects_non_ca_certificate() {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["leaf.example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let err = CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap_err();
        assert!(matches!(err, SigningError::InvalidCa(_)));
    }

    #[test]
    fn test_rejects_bad_key() {
        let ca = CertificateAuthority::generate_self_signed("Test CA").unwrap();
        let err = CertificateAuthority::from_pem(ca.cert_pem(), "not a key").unwrap_err();
        assert!(matches!(err, SigningError::InvalidCa(_)));
    }

    #[test]
    fn test_missing_files() {
        let err = CertificateAuthority::from_pem_files(
            Path::new("/nonexistent/ca.crt"),
            Path::new("/nonexistent/ca.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }
}
