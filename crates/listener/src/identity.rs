//! Serving identity: SAN sets and the required identity.
//!
//! SAN names are normalized before they are compared or stored:
//!
//! - surrounding whitespace and a trailing `.` are removed
//! - DNS names are lower-cased
//! - IP literals are reduced to their canonical textual form
//!   (`[::1]` and `0:0:0:0:0:0:0:1` both become `::1`)
//!
//! The set is ordered and de-duplicated, so two records carrying the same
//! names in a different order or case compare equal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use certmesh_common::types::TlsVersion;
use certmesh_config::{
    IdentityConfig, ListenerConfig, SniLearningConfig, DEFAULT_MAX_LEARNED_SANS,
};

/// Ordered, normalized, de-duplicated set of Subject Alternative Names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SanSet(BTreeSet<String>);

impl SanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a single name; `None` for names that are empty after trimming
    pub fn normalize(name: &str) -> Option<String> {
        let trimmed = name.trim().trim_end_matches('.');
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        if unbracketed.is_empty() {
            return None;
        }

        match unbracketed.parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_string()),
            Err(_) => Some(unbracketed.to_ascii_lowercase()),
        }
    }

    /// Whether a (normalized) name is an IP literal
    pub fn is_ip(name: &str) -> bool {
        name.parse::<IpAddr>().is_ok()
    }

    /// Insert a name, returning `true` if it was not already present
    pub fn insert(&mut self, name: &str) -> bool {
        match Self::normalize(name) {
            Some(normalized) => self.0.insert(normalized),
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        Self::normalize(name).is_some_and(|n| self.0.contains(&n))
    }

    pub fn union(&self, other: &SanSet) -> SanSet {
        SanSet(self.0.union(&other.0).cloned().collect())
    }

    /// Add every name of `other`, returning `true` if the set grew
    pub fn extend_from(&mut self, other: &SanSet) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() > before
    }

    pub fn is_superset(&self, other: &SanSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Names of `self` that `other` does not cover
    pub fn missing_from(&self, other: &SanSet) -> SanSet {
        SanSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SanSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = SanSet::new();
        for name in iter {
            set.insert(name.as_ref());
        }
        set
    }
}

impl From<Vec<String>> for SanSet {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<SanSet> for Vec<String> {
    fn from(set: SanSet) -> Self {
        set.0.into_iter().collect()
    }
}

impl fmt::Display for SanSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// What the served certificate must satisfy.
///
/// The SAN set only ever grows over the lifetime of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredIdentity {
    pub common_name: String,
    pub organization: String,
    pub sans: SanSet,
    pub min_tls_version: TlsVersion,
    pub cipher_suites: Vec<String>,
}

impl RequiredIdentity {
    pub fn new(
        common_name: impl Into<String>,
        organization: impl Into<String>,
        sans: SanSet,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.into(),
            sans,
            min_tls_version: TlsVersion::default(),
            cipher_suites: Vec::new(),
        }
    }

    pub fn from_config(identity: &IdentityConfig, listener: &ListenerConfig) -> Self {
        Self {
            common_name: identity.common_name.clone(),
            organization: identity.organization.clone(),
            sans: identity.effective_sans().into_iter().collect(),
            min_tls_version: listener.min_tls_version,
            cipher_suites: listener.cipher_suites.clone(),
        }
    }

    /// Merge a newer requirement into this one.
    ///
    /// SANs are unioned. A non-empty common name or organization replaces
    /// the current one for certificates generated from now on; records
    /// already issued are not invalidated by a subject change alone.
    /// Returns `true` if anything changed.
    pub fn grow(&mut self, newer: &RequiredIdentity) -> bool {
        let mut changed = self.sans.extend_from(&newer.sans);

        if !newer.common_name.is_empty() && newer.common_name != self.common_name {
            self.common_name = newer.common_name.clone();
            changed = true;
        }
        if !newer.organization.is_empty() && newer.organization != self.organization {
            self.organization = newer.organization.clone();
            changed = true;
        }

        changed
    }

    /// Copy of this identity with a wider SAN set
    pub fn with_sans(&self, sans: SanSet) -> Self {
        Self {
            sans,
            ..self.clone()
        }
    }
}

/// Filter for names learned from ClientHello server names
#[derive(Debug, Clone)]
pub struct SniFilter {
    suffixes: Vec<String>,
    allow_ip: bool,
    max_learned: usize,
}

impl SniFilter {
    pub fn new(suffixes: impl IntoIterator<Item = impl AsRef<str>>, allow_ip: bool) -> Self {
        Self {
            suffixes: suffixes
                .into_iter()
                .filter_map(|s| SanSet::normalize(s.as_ref()))
                .collect(),
            allow_ip,
            max_learned: DEFAULT_MAX_LEARNED_SANS,
        }
    }

    /// Learn at most `max` names over the process lifetime
    pub fn with_max_learned(mut self, max: usize) -> Self {
        self.max_learned = max;
        self
    }

    /// `None` when learning is disabled
    pub fn from_config(config: &SniLearningConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(&config.allowed_suffixes, config.allow_ip)
                .with_max_learned(config.max_learned_sans)
        })
    }

    pub fn max_learned(&self) -> usize {
        self.max_learned
    }

    /// Whether a normalized name may be learned.
    ///
    /// A suffix `.example.com` (or `example.com`) admits `a.example.com`
    /// and `example.com` itself but not `badexample.com`.
    pub fn accepts(&self, name: &str) -> bool {
        if SanSet::is_ip(name) {
            return self.allow_ip;
        }

        self.suffixes.iter().any(|suffix| {
            let bare = suffix.trim_start_matches('.');
            name == bare
                || name
                    .strip_suffix(bare)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
