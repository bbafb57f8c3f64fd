#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use certmesh_listener::{
    CertificateAuthority, CertificateCoordinator, CertificateFactory, CoordinatorPolicy,
    CoordinatorStats, DurableBackend, RequiredIdentity, SlotKey, TieredCertStore,
};

pub const VALIDITY: Duration = Duration::from_secs(365 * 86400);

pub fn test_ca() -> Arc<CertificateAuthority> {
    Arc::new(CertificateAuthority::generate_self_signed("Integration Test CA").unwrap())
}

/// Short backoff and a long check interval so tests drive checks explicitly
pub fn test_policy() -> CoordinatorPolicy {
    CoordinatorPolicy {
        renewal_lead: Duration::from_secs(90 * 86400),
        check_interval: Duration::from_secs(3600),
        max_attempts: 8,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
    }
}

pub fn identity(sans: &[&str]) -> RequiredIdentity {
    RequiredIdentity::new("certmesh", "certmesh", sans.iter().collect())
}

pub fn coordinator_with_store(
    ca: &Arc<CertificateAuthority>,
    store: TieredCertStore,
    sans: &[&str],
) -> Arc<CertificateCoordinator> {
    build(ca, store, sans, VALIDITY)
}

fn build(
    ca: &Arc<CertificateAuthority>,
    store: TieredCertStore,
    sans: &[&str],
    validity: Duration,
) -> Arc<CertificateCoordinator> {
    Arc::new(CertificateCoordinator::new(
        SlotKey::default(),
        store,
        CertificateFactory::new(Arc::clone(ca), validity),
        identity(sans),
        test_policy(),
    ))
}

fn process_store(backend: Arc<dyn DurableBackend>) -> TieredCertStore {
    TieredCertStore::builder(backend)
        .resubscribe_delay(Duration::from_millis(20))
        .build()
}

/// One "process": its own memory tier over a shared durable backend
pub fn coordinator(
    ca: &Arc<CertificateAuthority>,
    backend: Arc<dyn DurableBackend>,
    sans: &[&str],
) -> Arc<CertificateCoordinator> {
    build(ca, process_store(backend), sans, VALIDITY)
}

/// A process whose factory issues leaves with a different validity
pub fn coordinator_with_validity(
    ca: &Arc<CertificateAuthority>,
    backend: Arc<dyn DurableBackend>,
    sans: &[&str],
    validity: Duration,
) -> Arc<CertificateCoordinator> {
    build(ca, process_store(backend), sans, validity)
}

/// Poll `coordinator` until `predicate` holds or five seconds pass
pub async fn wait_for(
    coordinator: &CertificateCoordinator,
    predicate: impl Fn(&CoordinatorStats) -> bool,
) -> CoordinatorStats {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = coordinator.stats();
        if predicate(&stats) || tokio::time::Instant::now() > deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
