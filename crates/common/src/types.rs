//! Shared configuration value types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum TLS protocol version accepted by the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2", alias = "TLS1.2", alias = "tls12")]
    Tls12,
    #[serde(rename = "1.3", alias = "TLS1.3", alias = "tls13")]
    Tls13,
}

impl TlsVersion {
    /// Parse a version string, accepting the common spellings.
    ///
    /// Returns `None` for anything that is not TLS 1.2 or 1.3; older
    /// protocol versions are not supported.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match normalized.as_str() {
            "12" | "tls12" | "versiontls12" => Some(Self::Tls12),
            "13" | "tls13" | "versiontls13" => Some(Self::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => write!(f, "TLS1.2"),
            Self::Tls13 => write!(f, "TLS1.3"),
        }
    }
}

/// Client certificate handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// Never ask for a client certificate
    None,
    /// Ask for a client certificate and verify it against the serving CA
    /// when one is presented; anonymous clients are still accepted
    #[default]
    Request,
}

impl ClientAuthMode {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "no" => Some(Self::None),
            "request" | "optional" => Some(Self::Request),
            _ => None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}
