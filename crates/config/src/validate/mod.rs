//! Configuration validation.
//!
//! Static checks run on every load; runtime checks (CA files, bind address)
//! need the `validation` feature and a tokio runtime.

#[cfg(feature = "validation")]
mod certs;
#[cfg(feature = "validation")]
mod network;

#[cfg(feature = "validation")]
pub use certs::validate_ca_files;
#[cfg(feature = "validation")]
pub use network::validate_bind_address;

use std::fmt;
use std::net::IpAddr;

use certmesh_common::types::TlsVersion;

use crate::Config;

/// Which part of the configuration a finding refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Listener,
    Identity,
    Renewal,
    Storage,
    Certificate,
    Network,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listener => "listener",
            Self::Identity => "identity",
            Self::Renewal => "renewal",
            Self::Storage => "storage",
            Self::Certificate => "certificate",
            Self::Network => "network",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated findings of one validation pass
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// TLS 1.3 suite names as accepted in `cipher-suites`
const TLS13_SUITES: &[&str] = &[
    "TLS_AES_256_GCM_SHA384",
    "TLS_AES_128_GCM_SHA256",
    "TLS_CHACHA20_POLY1305_SHA256",
];

/// Checks that need no I/O
pub fn validate_static(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<IpAddr>().is_err() {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            format!("bind-address '{}' is not an IP address", listener.bind_address),
        ));
    }

    if listener.min_tls_version == TlsVersion::Tls13 && !listener.cipher_suites.is_empty() {
        let has_tls13 = listener.cipher_suites.iter().any(|name| {
            let normalized = name.to_uppercase().replace('-', "_");
            TLS13_SUITES.contains(&normalized.as_str())
        });
        if !has_tls13 {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                "min-tls-version 1.3 requires at least one TLS 1.3 cipher suite",
            ));
        }
    }

    if config.identity.common_name.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Identity,
            "common-name must not be empty",
        ));
    }

    if config.identity.sni_learning.enabled
        && config.identity.sni_learning.allowed_suffixes.is_empty()
        && !config.identity.sni_learning.allow_ip
    {
        result.add_warning(ValidationWarning::new(
            "sni-learning is enabled but no allowed-suffixes or allow-ip are set; no names will be learned",
        ));
    }

    if config.identity.sni_learning.enabled && config.identity.sni_learning.max_learned_sans == 0 {
        result.add_warning(ValidationWarning::new(
            "sni-learning is enabled with max-learned-sans 0; no names will be learned",
        ));
    }

    let renewal = &config.renewal;
    if renewal.validity_days <= renewal.lead_days {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            format!(
                "validity-days ({}) must exceed lead-days ({}) or every certificate is born expiring",
                renewal.validity_days, renewal.lead_days
            ),
        ));
    }
    if renewal.check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "check-interval-secs must be positive",
        ));
    } else if renewal.check_interval_secs > u64::from(renewal.lead_days) * 86_400 {
        result.add_warning(ValidationWarning::new(format!(
            "check-interval-secs ({}) is longer than the renewal lead window; certificates may expire unrenewed",
            renewal.check_interval_secs
        )));
    }
    if renewal.max_attempts == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "max-attempts must be at least 1",
        ));
    }

    if config.storage.slot.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            "slot must not be empty",
        ));
    }
    if config.storage.poll_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            "poll-interval-secs must be positive",
        ));
    }
    if config.server.handshake_timeout_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            "handshake-timeout-secs must be positive",
        ));
    }

    result
}
