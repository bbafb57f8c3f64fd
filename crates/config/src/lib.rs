//! Configuration for the certmesh dynamic TLS listener.
//!
//! Configuration is read from KDL (preferred) or TOML. Every block is
//! optional and every field has a default, so an empty document is a valid
//! configuration serving `localhost` on port 9345.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub mod identity;
pub mod kdl;
pub mod renewal;
pub mod server;
pub mod storage;
pub mod validate;

// ============================================================================
// Re-exports
// ============================================================================

pub use identity::{IdentityConfig, SniLearningConfig, DEFAULT_MAX_LEARNED_SANS};
pub use renewal::RenewalConfig;
pub use server::{ListenerConfig, ServerConfig};
pub use storage::{CaConfig, StorageConfig};
pub use validate::{
    validate_static, ErrorCategory, ValidationError, ValidationResult, ValidationWarning,
};

#[cfg(feature = "validation")]
pub use validate::{validate_bind_address, validate_ca_files};

const DEFAULT_CONFIG_KDL: &str = include_str!("default.kdl");

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration is invalid: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub listener: ListenerConfig,
    pub identity: IdentityConfig,
    pub renewal: RenewalConfig,
    pub storage: StorageConfig,
    pub ca: CaConfig,
}

impl Config {
    /// Load configuration from a file, choosing the format by extension.
    ///
    /// `.toml` files are parsed as TOML; anything else as KDL.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("kdl") | None => Self::from_kdl_str(&content)?,
            Some(other) => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_kdl_str(content: &str) -> Result<Self, ConfigError> {
        kdl::parse_config(content).map_err(|e| ConfigError::Parse(format!("{:#}", e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The configuration compiled into the binary
    pub fn default_embedded() -> Result<Self, ConfigError> {
        debug!("Using embedded default configuration");
        Self::from_kdl_str(DEFAULT_CONFIG_KDL)
    }

    /// Run the static checks, failing on any error.
    ///
    /// Warnings are returned to the caller for logging.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>, ConfigError> {
        let result = validate_static(self);
        if result.is_ok() {
            Ok(result.warnings)
        } else {
            Err(ConfigError::Validation(
                result.errors.iter().map(ToString::to_string).collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certmesh_common::types::{ClientAuthMode, TlsVersion};
    use std::io::Write;

    #[test]
    fn test_embedded_default_matches_struct_default() {
        let embedded = Config::default_embedded().unwrap();
        assert_eq!(embedded, Config::default());
        assert!(embedded.validate().unwrap().is_empty());
    }

    #[test]
    fn test_empty_kdl_is_default() {
        assert_eq!(Config::from_kdl_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_kdl() {
        let config = Config::from_kdl_str(
            r#"
            listener {
                bind-address "127.0.0.1"
                port 8443
                min-tls-version "1.3"
                cipher-suites "TLS_AES_128_GCM_SHA256"
                client-auth "none"
            }
            identity {
                common-name "node1"
                sans "node1.cluster.local" "10.0.0.5"
                sans "node1"
                sni-learning {
                    enabled
                    allowed-suffixes ".cluster.local"
                    max-learned-sans 8
                }
            }
            renewal {
                lead-days 30
                validity-days 90
            }
            storage {
                durable-dir "/mnt/shared"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.socket_address(), "127.0.0.1:8443");
        assert_eq!(config.listener.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.listener.client_auth, ClientAuthMode::None);
        assert_eq!(config.identity.common_name, "node1");
        assert_eq!(config.identity.organization, "node1");
        assert_eq!(
            config.identity.sans,
            vec!["node1.cluster.local", "10.0.0.5", "node1"]
        );
        assert!(config.identity.sni_learning.enabled);
        assert_eq!(config.identity.sni_learning.allowed_suffixes, vec![".cluster.local"]);
        assert_eq!(config.identity.sni_learning.max_learned_sans, 8);
        assert_eq!(config.renewal.lead_days, 30);
        assert_eq!(config.renewal.validity_days, 90);
        assert_eq!(config.renewal.max_attempts, RenewalConfig::default().max_attempts);
        assert_eq!(config.storage.durable_dir, Path::new("/mnt/shared"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kdl_rejects_bad_tls_version() {
        let err = Config::from_kdl_str(
            r#"
            listener {
                min-tls-version "1.0"
            }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min-tls-version"));
    }

    #[test]
    fn test_kdl_rejects_out_of_range_port() {
        let err = Config::from_kdl_str("listener {\n port 70000\n}\n").unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml_str(
            r#"
            [listener]
            port = 9443
            min-tls-version = "1.3"

            [identity]
            common-name = "edge"
            sans = ["edge.example.com"]

            [storage]
            slot = "edge-serving"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 9443);
        assert_eq!(config.listener.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.identity.sans, vec!["edge.example.com"]);
        assert_eq!(config.storage.slot, "edge-serving");
        assert_eq!(config.renewal, RenewalConfig::default());
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();

        let kdl_path = dir.path().join("certmesh.kdl");
        let mut file = std::fs::File::create(&kdl_path).unwrap();
        writeln!(file, "listener {{\n    port 10443\n}}").unwrap();
        assert_eq!(Config::from_file(&kdl_path).unwrap().listener.port, 10443);

        let toml_path = dir.path().join("certmesh.toml");
        std::fs::write(&toml_path, "[listener]\nport = 11443\n").unwrap();
        assert_eq!(Config::from_file(&toml_path).unwrap().listener.port, 11443);

        let yaml_path = dir.path().join("certmesh.yaml");
        std::fs::write(&yaml_path, "listener: {}\n").unwrap();
        assert!(matches!(
            Config::from_file(&yaml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/certmesh.kdl").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
