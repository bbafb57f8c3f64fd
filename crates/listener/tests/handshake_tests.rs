//! Real TLS handshakes against a running server

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use certmesh_common::types::ClientAuthMode;
use certmesh_listener::{
    CertificateAuthority, CertificateCoordinator, Convergence, DynamicListener, MemoryBackend,
    ServerLifecycle, StatusHandler, TlsOptions,
};
use rustls::pki_types::{CertificateDer, ServerName};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

fn connector(ca: &CertificateAuthority) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.cert_der().clone()).unwrap();

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

async fn connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    server_name: &'static str,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name).unwrap();
    connector.connect(name, tcp).await
}

fn peer_leaf(stream: &TlsStream<TcpStream>) -> CertificateDer<'static> {
    stream.get_ref().1.peer_certificates().unwrap()[0].clone().into_owned()
}

async fn get_status(mut stream: TlsStream<TcpStream>) -> String {
    stream
        .write_all(b"GET /status HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn start(
    coordinator: Arc<CertificateCoordinator>,
    ca: &CertificateAuthority,
) -> (
    SocketAddr,
    tokio_util::sync::CancellationToken,
    tokio::task::JoinHandle<()>,
) {
    let options = TlsOptions {
        client_auth: ClientAuthMode::Request,
        alpn_protocols: vec!["http/1.1".to_string()],
        client_ca: Some(ca.cert_der().clone()),
    };
    let listener = DynamicListener::bind(
        "127.0.0.1:0",
        Arc::clone(&coordinator),
        options,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let server = ServerLifecycle::new(
        listener,
        StatusHandler::new(coordinator),
        Duration::from_secs(2),
    );
    let addr = server.local_addr();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });

    (addr, shutdown, handle)
}

#[tokio::test]
async fn test_handshake_serves_bootstrapped_certificate() {
    let ca = test_ca();
    let coordinator = coordinator(&ca, Arc::new(MemoryBackend::new()), &["localhost"]);
    let (addr, shutdown, handle) = start(Arc::clone(&coordinator), &ca).await;

    // The listener bootstrapped the coordinator while binding
    assert_eq!(coordinator.stats().revision, Some(1));

    let stream = connect(&connector(&ca), addr, "localhost").await.unwrap();
    assert_eq!(
        &peer_leaf(&stream),
        coordinator.active_slot().unwrap().record.cert_der()
    );

    let response = get_status(stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"revision\": 1"));
    assert!(response.contains("\"state\": \"serving\""));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_hot_swap_without_restart() {
    let ca = test_ca();
    let coordinator = coordinator(&ca, Arc::new(MemoryBackend::new()), &["localhost"]);
    let (addr, shutdown, handle) = start(Arc::clone(&coordinator), &ca).await;
    let connector = connector(&ca);

    // An established connection survives the swap
    let before = connect(&connector, addr, "localhost").await.unwrap();
    let old_leaf = peer_leaf(&before);

    coordinator.update_required_identity(&identity(&["node1.cluster.local"]));
    assert_eq!(coordinator.check().await.unwrap(), Convergence::Generated(2));

    let after = connect(&connector, addr, "node1.cluster.local").await.unwrap();
    let new_leaf = peer_leaf(&after);
    assert_ne!(old_leaf, new_leaf);
    assert_eq!(
        &new_leaf,
        coordinator.active_slot().unwrap().record.cert_der()
    );

    // Same socket, both connections still usable
    assert!(get_status(before).await.contains("\"revision\": 2"));
    assert!(get_status(after).await.starts_with("HTTP/1.1 200 OK"));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sni_learning_through_handshakes() {
    let ca = test_ca();
    let store = certmesh_listener::TieredCertStore::new(Arc::new(MemoryBackend::new()));
    let coordinator = Arc::new(
        CertificateCoordinator::new(
            certmesh_listener::SlotKey::default(),
            store,
            certmesh_listener::CertificateFactory::new(Arc::clone(&ca), VALIDITY),
            identity(&["localhost"]),
            test_policy(),
        )
        .with_sni_learning(Some(certmesh_listener::SniFilter::new(
            [".cluster.local"],
            false,
        ))),
    );
    let (addr, shutdown, handle) = start(Arc::clone(&coordinator), &ca).await;
    let connector = connector(&ca);

    // Not yet covered: the handshake fails, but the name is learned
    assert!(connect(&connector, addr, "node4.cluster.local").await.is_err());
    assert!(coordinator
        .required_identity()
        .sans
        .contains("node4.cluster.local"));

    assert_eq!(coordinator.check().await.unwrap(), Convergence::Generated(2));
    connect(&connector, addr, "node4.cluster.local").await.unwrap();

    // Names outside the suffix filter are ignored
    assert!(connect(&connector, addr, "evil.example.com").await.is_err());
    assert!(!coordinator
        .required_identity()
        .sans
        .contains("evil.example.com"));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_and_releases_socket() {
    let ca = test_ca();
    let coordinator = coordinator(&ca, Arc::new(MemoryBackend::new()), &["localhost"]);
    let (addr, shutdown, handle) = start(Arc::clone(&coordinator), &ca).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        coordinator.state(),
        certmesh_listener::CoordinatorState::Draining
    );
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_with_stalled_client_stays_within_drain_timeout() {
    let ca = test_ca();
    let coordinator = coordinator(&ca, Arc::new(MemoryBackend::new()), &["localhost"]);
    let (addr, shutdown, handle) = start(Arc::clone(&coordinator), &ca).await;

    // Never sends a ClientHello: the connection outlives the drain timeout
    let _stalled = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(4), handle)
        .await
        .unwrap()
        .unwrap();

    // Two second drain timeout, spent once
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
}
