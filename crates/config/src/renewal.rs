//! Renewal policy configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RenewalConfig {
    /// Renew when the certificate expires within this many days
    pub lead_days: u32,
    /// Validity window of newly generated certificates
    pub validity_days: u32,
    /// Periodic re-validation interval
    pub check_interval_secs: u64,
    /// Generate/save/adopt attempts before giving up
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            lead_days: 90,
            validity_days: 365,
            check_interval_secs: 3600,
            max_attempts: 8,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
        }
    }
}
