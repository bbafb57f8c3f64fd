//! Serve loop and shutdown sequencing.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drain::ConnectionTracker;
use crate::errors::{HandshakeError, ListenerError};
use crate::listener::DynamicListener;

/// Default upper bound on waiting for in-flight connections
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Handles one TLS connection after the handshake
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TlsStream<TcpStream>, peer: SocketAddr) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: ConnectionHandler + ?Sized> ConnectionHandler for Arc<H> {
    async fn handle(&self, stream: TlsStream<TcpStream>, peer: SocketAddr) -> anyhow::Result<()> {
        (**self).handle(stream, peer).await
    }
}

/// Runs a [`DynamicListener`] with a handler chain until cancelled
pub struct ServerLifecycle {
    listener: DynamicListener,
    handler: Arc<dyn ConnectionHandler>,
    tracker: ConnectionTracker,
    shutdown: CancellationToken,
    drain_timeout: Duration,
}

impl ServerLifecycle {
    pub fn new(
        listener: DynamicListener,
        handler: impl ConnectionHandler,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
            tracker: ConnectionTracker::new(),
            shutdown: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Wrap the current handler chain with another layer
    pub fn wrap<F, H>(mut self, layer: F) -> Self
    where
        F: FnOnce(Arc<dyn ConnectionHandler>) -> H,
        H: ConnectionHandler,
    {
        self.handler = Arc::new(layer(self.handler));
        self
    }

    /// Cancelling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn listener(&self) -> &DynamicListener {
        &self.listener
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// Starts the coordinator's background tasks, accepts connections (one
    /// task each), then drains: background tasks stop, in-flight
    /// connections get up to the drain timeout, and the socket is released
    /// last.
    pub async fn run(self) -> Result<(), ListenerError> {
        let coordinator = Arc::clone(self.listener.coordinator());
        let background = coordinator.spawn_background();
        let force_close = CancellationToken::new();

        info!(address = %self.listener.local_addr(), "Serving TLS connections");

        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let incoming = match incoming {
                Ok(incoming) => incoming,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let guard = self.tracker.track();
            let handler = Arc::clone(&self.handler);
            let force_close = force_close.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let peer = incoming.peer_addr();

                let work = async {
                    let stream = match incoming.handshake().await {
                        Ok(stream) => stream,
                        Err(HandshakeError::NotReady) => {
                            warn!(peer = %peer, "Rejected connection, no certificate available");
                            return;
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };

                    if let Err(e) = handler.handle(stream, peer).await {
                        debug!(peer = %peer, error = %e, "Connection handler failed");
                    }
                };

                tokio::select! {
                    _ = work => {}
                    _ = force_close.cancelled() => {
                        debug!(peer = %peer, "Connection closed at drain timeout");
                    }
                }
            });
        }

        info!(
            active_connections = self.tracker.active_count(),
            "Shutting down TLS listener"
        );
        // One deadline covers both connection drain and background tasks
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        coordinator.drain();

        if !self.tracker.wait_for_drain(deadline).await {
            force_close.cancel();
        }
        background
            .join(deadline.saturating_duration_since(tokio::time::Instant::now()))
            .await;

        drop(self.listener);
        info!("TLS listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ServerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLifecycle")
            .field("listener", &self.listener)
            .field("active_connections", &self.tracker.active_count())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}
