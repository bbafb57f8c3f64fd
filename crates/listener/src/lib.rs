//! Certmesh Listener Library
//!
//! A TLS listener whose serving certificate manages itself: every process in
//! a cluster can generate, persist, adopt and renew one shared leaf
//! certificate signed by a common CA, and swap it into the running listener
//! without a restart.
//!
//! - **Factory**: leaf generation and validation against a CA
//! - **Store**: memory, file and durable tiers with compare-and-swap writes
//! - **Coordinator**: bootstrap, renewal, peer adoption and hot-swap
//! - **Listener**: rustls termination reading the active certificate per handshake
//! - **Server**: accept loop, handler chain and graceful drain
//!
//! # Example
//!
//! ```ignore
//! use certmesh_listener::*;
//!
//! let ca = Arc::new(CertificateAuthority::from_pem_files(&cert, &key)?);
//! let coordinator = Arc::new(CertificateCoordinator::new(
//!     SlotKey::default(),
//!     TieredCertStore::new(Arc::new(MemoryBackend::new())),
//!     CertificateFactory::new(ca.clone(), DEFAULT_VALIDITY),
//!     RequiredIdentity::new("certmesh", "certmesh", ["localhost"].into_iter().collect()),
//!     CoordinatorPolicy::default(),
//! ));
//!
//! let listener = DynamicListener::bind("0.0.0.0:9345", coordinator.clone(), TlsOptions::default(), DEFAULT_HANDSHAKE_TIMEOUT).await?;
//! ServerLifecycle::new(listener, StatusHandler::new(coordinator), DEFAULT_DRAIN_TIMEOUT).run().await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod ca;
pub mod coordinator;
pub mod drain;
pub mod errors;
pub mod factory;
pub mod handlers;
pub mod identity;
pub mod listener;
pub mod record;
pub mod server;
pub mod signals;
pub mod store;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use errors::{
    CoordinatorError, HandshakeError, ListenerError, RecordError, SigningError, StoreError,
};

// Certificates
pub use ca::CertificateAuthority;
pub use factory::{CertificateFactory, Validation, DEFAULT_RENEWAL_LEAD, DEFAULT_VALIDITY};
pub use identity::{RequiredIdentity, SanSet, SniFilter};
pub use record::{CertificateRecord, SlotDocument, StorageSlot};

// Storage
pub use store::{
    DirectoryBackend, DurableBackend, FileTier, LoadedSlot, MemoryBackend, PutOutcome,
    SaveOutcome, Tier, TieredCertStore,
};

// Coordination
pub use coordinator::{
    CertificateCoordinator, Convergence, CoordinatorPolicy, CoordinatorState, CoordinatorStats,
    CoordinatorTasks,
};

// Listener and server
pub use drain::{ConnectionGuard, ConnectionTracker};
pub use handlers::{AccessLog, StatusHandler};
pub use listener::{DynamicListener, IncomingConnection, DEFAULT_HANDSHAKE_TIMEOUT};
pub use server::{ConnectionHandler, ServerLifecycle, DEFAULT_DRAIN_TIMEOUT};
pub use signals::{spawn_signal_handler, SignalType};
pub use tls::{build_server_config, CoordinatorCertResolver, TlsOptions};

// Shared types
pub use certmesh_common::{SlotKey, WriterId};
