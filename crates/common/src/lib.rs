//! Common utilities and types shared across the certmesh crates.

pub mod backoff;
pub mod ids;
#[cfg(feature = "runtime")]
pub mod observability;
pub mod types;

pub use backoff::Backoff;
pub use ids::{SlotKey, WriterId, DEFAULT_SLOT_KEY};
pub use types::{ClientAuthMode, LogFormat, TlsVersion};
