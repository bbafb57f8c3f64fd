//! Type-safe identifier newtypes for certmesh.
//!
//! These types keep the durable slot key and the writer identity apart so a
//! node id is never passed where a storage key is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default slot key for the cluster serving certificate.
pub const DEFAULT_SLOT_KEY: &str = "certmesh-serving";

/// Key of a storage slot.
///
/// A slot holds exactly one serving certificate per logical identity. Every
/// tier (memory, file, durable) addresses the certificate by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form of the key.
    ///
    /// Anything outside `[A-Za-z0-9._-]` is replaced by `_` so a key can be
    /// used directly as a file stem by the file tier and directory backend.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for SlotKey {
    fn default() -> Self {
        Self(DEFAULT_SLOT_KEY.to_string())
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SlotKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a process writing to the durable tier.
///
/// Recorded alongside each persisted slot for diagnostics; never used to
/// resolve conflicts (revisions do that).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId(String);

impl WriterId {
    /// Create a new random writer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WriterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
