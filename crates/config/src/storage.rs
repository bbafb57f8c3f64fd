//! Storage tier and CA material configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use certmesh_common::ids::DEFAULT_SLOT_KEY;

/// Where certificates are cached and persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Durable slot key shared by every node in the cluster
    pub slot: String,
    /// Local data directory; the file cache lives in `<data-dir>/tls`
    pub data_dir: PathBuf,
    /// Shared directory used as the durable tier
    pub durable_dir: PathBuf,
    /// Change polling interval for the durable directory
    pub poll_interval_secs: u64,
}

impl StorageConfig {
    pub fn file_cache_dir(&self) -> PathBuf {
        self.data_dir.join("tls")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            slot: DEFAULT_SLOT_KEY.to_string(),
            data_dir: PathBuf::from("/var/lib/certmesh"),
            durable_dir: PathBuf::from("/var/lib/certmesh/shared"),
            poll_interval_secs: 15,
        }
    }
}

/// Certificate authority used to sign the serving certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CaConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("/var/lib/certmesh/ca/server-ca.crt"),
            key_file: PathBuf::from("/var/lib/certmesh/ca/server-ca.key"),
        }
    }
}
