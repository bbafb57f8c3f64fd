//! rustls server configuration backed by the coordinator.
//!
//! The resolver reads the coordinator's active certificate on every
//! ClientHello, so a swap takes effect on the next handshake without
//! rebuilding the `ServerConfig` or touching established connections.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use std::sync::Arc;
use tracing::{debug, info, trace};

use certmesh_common::types::{ClientAuthMode, TlsVersion};

use crate::coordinator::CertificateCoordinator;
use crate::errors::ListenerError;
use crate::identity::RequiredIdentity;

/// Serves whatever certificate the coordinator currently holds
#[derive(Debug)]
pub struct CoordinatorCertResolver {
    coordinator: Arc<CertificateCoordinator>,
}

impl CoordinatorCertResolver {
    pub fn new(coordinator: Arc<CertificateCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl ResolvesServerCert for CoordinatorCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(server_name) = client_hello.server_name() {
            trace!(server_name = %server_name, "Resolving certificate for SNI");
            self.coordinator.observe_server_name(server_name);
        }

        let key = self.coordinator.current_certified_key();
        if key.is_none() {
            debug!("No serving certificate available, rejecting handshake");
        }
        key
    }
}

/// Listener TLS options not carried by the identity
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub client_auth: ClientAuthMode,
    pub alpn_protocols: Vec<String>,
    /// Trust root for presented client certificates
    pub client_ca: Option<CertificateDer<'static>>,
}

/// Build the listener's `ServerConfig`.
///
/// Protocol versions and cipher suites come from the required identity;
/// certificates come from `resolver`.
pub fn build_server_config(
    identity: &RequiredIdentity,
    options: &TlsOptions,
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<ServerConfig, ListenerError> {
    let versions = resolve_protocol_versions(identity.min_tls_version);

    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if !identity.cipher_suites.is_empty() {
        provider.cipher_suites = resolve_cipher_suites(&identity.cipher_suites)?;
        info!(
            cipher_suites = ?identity.cipher_suites,
            count = provider.cipher_suites.len(),
            "Custom TLS cipher suites configured"
        );
    }
    let provider = Arc::new(provider);

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| {
            ListenerError::TlsConfig(format!("Invalid TLS protocol/cipher configuration: {}", e))
        })?;

    let mut config = match (options.client_auth, &options.client_ca) {
        (ClientAuthMode::Request, Some(ca)) => {
            let verifier = request_client_verifier(ca, provider)?;
            info!("Client certificates requested (optional)");
            builder
                .with_client_cert_verifier(verifier)
                .with_cert_resolver(resolver)
        }
        _ => builder.with_no_client_auth().with_cert_resolver(resolver),
    };

    config.alpn_protocols = options
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    info!(
        min_version = %identity.min_tls_version,
        alpn = ?options.alpn_protocols,
        "TLS server configuration built"
    );

    Ok(config)
}

fn request_client_verifier(
    ca: &CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, ListenerError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.clone())
        .map_err(|e| ListenerError::TlsConfig(format!("Failed to add client CA: {}", e)))?;

    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .allow_unauthenticated()
        .build()
        .map_err(|e| ListenerError::TlsConfig(format!("Failed to build client verifier: {}", e)))
}

fn resolve_protocol_versions(min: TlsVersion) -> Vec<&'static SupportedProtocolVersion> {
    match min {
        TlsVersion::Tls12 => vec![&rustls::version::TLS12, &rustls::version::TLS13],
        TlsVersion::Tls13 => vec![&rustls::version::TLS13],
    }
}

/// Map IANA cipher suite names onto the aws-lc-rs provider's suites
fn resolve_cipher_suites(names: &[String]) -> Result<Vec<SupportedCipherSuite>, ListenerError> {
    use rustls::crypto::aws_lc_rs::cipher_suite;

    let known: &[(&str, SupportedCipherSuite)] = &[
        // TLS 1.3
        ("TLS_AES_256_GCM_SHA384", cipher_suite::TLS13_AES_256_GCM_SHA384),
        ("TLS_AES_128_GCM_SHA256", cipher_suite::TLS13_AES_128_GCM_SHA256),
        (
            "TLS_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ),
        // TLS 1.2
        (
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
    ];

    let mut suites = Vec::with_capacity(names.len());
    for name in names {
        let normalized = name.trim().to_uppercase().replace('-', "_");
        match known.iter().find(|(n, _)| *n == normalized) {
            Some((_, suite)) => suites.push(*suite),
            None => {
                let available: Vec<&str> = known.iter().map(|(n, _)| *n).collect();
                return Err(ListenerError::TlsConfig(format!(
                    "Unknown cipher suite '{}'. Available: {}",
                    name,
                    available.join(", ")
                )));
            }
        }
    }

    Ok(suites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::coordinator::CoordinatorPolicy;
    use crate::factory::{CertificateFactory, DEFAULT_VALIDITY};
    use crate::store::{MemoryBackend, TieredCertStore};
    use certmesh_common::SlotKey;

    fn resolver() -> (Arc<CertificateAuthority>, Arc<CoordinatorCertResolver>) {
        let ca = Arc::new(CertificateAuthority::generate_self_signed("TLS Test CA").unwrap());
        let coordinator = CertificateCoordinator::new(
            SlotKey::default(),
            TieredCertStore::new(Arc::new(MemoryBackend::new())),
            CertificateFactory::new(ca.clone(), DEFAULT_VALIDITY),
            identity(),
            CoordinatorPolicy::default(),
        );
        (ca, Arc::new(CoordinatorCertResolver::new(Arc::new(coordinator))))
    }

    fn identity() -> RequiredIdentity {
        RequiredIdentity::new("certmesh", "certmesh", ["localhost"].into_iter().collect())
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(resolve_protocol_versions(TlsVersion::Tls12).len(), 2);
        let only13 = resolve_protocol_versions(TlsVersion::Tls13);
        assert_eq!(only13.len(), 1);
        assert_eq!(only13[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn test_cipher_suite_names() {
        let suites = resolve_cipher_suites(&[
            "tls-aes-128-gcm-sha256".to_string(),
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384".to_string(),
        ])
        .unwrap();
        assert_eq!(suites.len(), 2);

        let err = resolve_cipher_suites(&["TLS_RSA_WITH_RC4_128_MD5".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Unknown cipher suite"));
    }

    #[test]
    fn test_build_server_config() {
        let (ca, resolver) = resolver();
        let options = TlsOptions {
            client_auth: ClientAuthMode::Request,
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            client_ca: Some(ca.cert_der().clone()),
        };

        let config = build_server_config(&identity(), &options, resolver).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_build_rejects_mismatched_suites() {
        let (_, resolver) = resolver();
        let mut identity = identity();
        identity.min_tls_version = TlsVersion::Tls13;
        identity.cipher_suites = vec!["TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string()];

        let result = build_server_config(&identity, &TlsOptions::default(), resolver);
        assert!(matches!(result, Err(ListenerError::TlsConfig(_))));
    }
}
