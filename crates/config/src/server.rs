//! Server and listener configuration.

use serde::{Deserialize, Serialize};

use certmesh_common::types::{ClientAuthMode, LogFormat, TlsVersion};

/// Process-level server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Upper bound on waiting for in-flight connections at shutdown
    pub drain_timeout_secs: u64,
    /// Upper bound on a single TLS handshake
    pub handshake_timeout_secs: u64,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            log_format: LogFormat::default(),
        }
    }
}

/// TLS listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub min_tls_version: TlsVersion,
    /// IANA cipher suite names; empty means the provider defaults
    pub cipher_suites: Vec<String>,
    pub client_auth: ClientAuthMode,
    pub alpn_protocols: Vec<String>,
}

impl ListenerConfig {
    /// `address:port` string suitable for binding.
    pub fn socket_address(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            min_tls_version: TlsVersion::Tls12,
            cipher_suites: Vec::new(),
            client_auth: ClientAuthMode::Request,
            alpn_protocols: default_alpn_protocols(),
        }
    }
}

pub fn default_drain_timeout() -> u64 {
    30
}

pub fn default_handshake_timeout() -> u64 {
    10
}

pub fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

pub fn default_port() -> u16 {
    9345
}

pub fn default_alpn_protocols() -> Vec<String> {
    vec!["http/1.1".to_string()]
}
