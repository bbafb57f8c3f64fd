//! TLS-terminating listener whose certificate follows the coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::coordinator::{CertificateCoordinator, CoordinatorState};
use crate::errors::{HandshakeError, ListenerError};
use crate::identity::RequiredIdentity;
use crate::tls::{build_server_config, CoordinatorCertResolver, TlsOptions};

/// Default upper bound on a single TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound TCP listener presenting the coordinator's current certificate.
///
/// Certificate changes never restart the socket: the resolver reads the
/// active certificate per handshake.
pub struct DynamicListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    coordinator: Arc<CertificateCoordinator>,
    handshake_timeout: Duration,
    local_addr: SocketAddr,
}

impl DynamicListener {
    /// Obtain an initial certificate, then bind `address`.
    ///
    /// Bootstrap errors are returned as-is; they are fatal for the listener.
    pub async fn bind(
        address: &str,
        coordinator: Arc<CertificateCoordinator>,
        options: TlsOptions,
        handshake_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        if coordinator.state() == CoordinatorState::Bootstrapping {
            coordinator.bootstrap().await?;
        }

        let identity = coordinator.required_identity();
        let resolver = Arc::new(CoordinatorCertResolver::new(Arc::clone(&coordinator)));
        let config = build_server_config(&identity, &options, resolver)?;

        let tcp = TcpListener::bind(address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = tcp.local_addr().map_err(|source| ListenerError::Bind {
            address: address.to_string(),
            source,
        })?;

        info!(
            address = %local_addr,
            handshake_timeout_secs = handshake_timeout.as_secs(),
            "TLS listener bound"
        );

        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            coordinator,
            handshake_timeout,
            local_addr,
        })
    }

    /// Accept the next TCP connection.
    ///
    /// The handshake is deferred to [`IncomingConnection::handshake`] so it
    /// can run on the connection's own task.
    pub async fn accept(&self) -> Result<IncomingConnection, ListenerError> {
        let (stream, peer) = self.tcp.accept().await.map_err(ListenerError::Accept)?;
        trace!(peer = %peer, "Accepted TCP connection");

        Ok(IncomingConnection {
            stream,
            peer,
            acceptor: self.acceptor.clone(),
            coordinator: Arc::clone(&self.coordinator),
            timeout: self.handshake_timeout,
        })
    }

    /// Grow the required identity; picked up by the next periodic check
    pub fn update_required_identity(&self, newer: &RequiredIdentity) -> bool {
        self.coordinator.update_required_identity(newer)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<CertificateCoordinator> {
        &self.coordinator
    }
}

impl std::fmt::Debug for DynamicListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicListener")
            .field("local_addr", &self.local_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// An accepted connection awaiting its TLS handshake
pub struct IncomingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    coordinator: Arc<CertificateCoordinator>,
    timeout: Duration,
}

impl IncomingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the TLS handshake with the certificate active right now
    pub async fn handshake(self) -> Result<TlsStream<TcpStream>, HandshakeError> {
        if self.coordinator.current_certified_key().is_none() {
            return Err(HandshakeError::NotReady);
        }

        let stream = tokio::time::timeout(self.timeout, self.acceptor.accept(self.stream))
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout))??;

        debug!(
            peer = %self.peer,
            server_name = ?stream.get_ref().1.server_name(),
            alpn = ?stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "TLS handshake complete"
        );
        Ok(stream)
    }
}
