//! Serving identity configuration.

use serde::{Deserialize, Serialize};

/// Subject of the serving certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdentityConfig {
    pub common_name: String,
    pub organization: String,
    /// Static SANs; `localhost` is always added
    pub sans: Vec<String>,
    pub sni_learning: SniLearningConfig,
}

impl IdentityConfig {
    /// Configured SANs plus the always-present `localhost`.
    pub fn effective_sans(&self) -> Vec<String> {
        let mut sans = self.sans.clone();
        if !sans.iter().any(|s| s.eq_ignore_ascii_case("localhost")) {
            sans.push("localhost".to_string());
        }
        sans
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            common_name: default_common_name(),
            organization: default_common_name(),
            sans: Vec::new(),
            sni_learning: SniLearningConfig::default(),
        }
    }
}

/// Default cap on names learned from client hellos
pub const DEFAULT_MAX_LEARNED_SANS: usize = 32;

/// Learning SANs from server names presented by clients.
///
/// Disabled by default: any client can present any server name, so names
/// are only learned when they match an allowed suffix (or are IP literals
/// and `allow-ip` is set), and at most `max-learned-sans` of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SniLearningConfig {
    pub enabled: bool,
    pub allowed_suffixes: Vec<String>,
    pub allow_ip: bool,
    pub max_learned_sans: usize,
}

impl Default for SniLearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_suffixes: Vec::new(),
            allow_ip: false,
            max_learned_sans: DEFAULT_MAX_LEARNED_SANS,
        }
    }
}

pub fn default_common_name() -> String {
    "certmesh".to_string()
}
