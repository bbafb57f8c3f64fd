//! Error types for the certificate manager.
//!
//! Only [`SigningError`] and [`CoordinatorError::BootstrapFailed`] stop the
//! listener from ever serving; everything else is recoverable and logged by
//! the component that observes it.

use std::time::Duration;
use thiserror::Error;

use crate::store::Tier;

/// Failure to produce a signed leaf certificate
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("CA key pair is unusable: {0}")]
    InvalidCa(String),

    #[error("SAN '{san}' cannot be encoded: {reason}")]
    InvalidSan { san: String, reason: String },

    #[error("Certificate signing failed: {0}")]
    Signing(String),

    #[error("Generated certificate is unreadable: {0}")]
    Record(#[from] RecordError),
}

/// Failure to decode certificate or key material
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("Invalid PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error("Invalid X.509 certificate: {0}")]
    X509(String),

    #[error("Unsupported private key: {0}")]
    Key(String),
}

/// Storage tier failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// A cache tier could not be read; callers treat this as a miss
    #[error("{tier} tier miss for slot '{key}': {reason}")]
    TierMiss {
        tier: Tier,
        key: String,
        reason: String,
    },

    /// The durable slot exists but its payload cannot be decoded
    #[error("Durable slot '{key}' at revision {revision} is corrupt: {reason}")]
    CorruptSlot {
        key: String,
        revision: u64,
        reason: String,
    },

    #[error("Durable backend error: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Slot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-connection handshake failure; the connection is dropped
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("No serving certificate is available yet")]
    NotReady,

    #[error("TLS handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS handshake failed: {0}")]
    Tls(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Bootstrap failed after {attempts} attempts: {last_error}")]
    BootstrapFailed { attempts: u32, last_error: String },

    #[error("Renewal failed after {attempts} attempts: {last_error}")]
    RenewalFailed { attempts: u32, last_error: String },

    #[error("Coordinator is draining")]
    Draining,
}

impl CoordinatorError {
    /// Whether the listener can never serve after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Signing(_) | Self::BootstrapFailed { .. })
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),
}
