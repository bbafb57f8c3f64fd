//! OS signal handling.
//!
//! SIGTERM and SIGINT start a graceful shutdown; SIGHUP forces an immediate
//! certificate re-validation.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::CertificateCoordinator;

/// Signal type delivered to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Re-validate the serving certificate (SIGHUP)
    Revalidate,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Spawn the signal loop; it exits after the first shutdown signal
pub fn spawn_signal_handler(
    coordinator: Arc<CertificateCoordinator>,
    shutdown: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let mut signals = SignalStream::new()?;

    Ok(tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => signal,
            };

            match signal {
                Some(SignalType::Revalidate) => {
                    info!("Received SIGHUP, re-validating serving certificate");
                    coordinator.request_check();
                }
                Some(SignalType::Shutdown) => {
                    info!("Received shutdown signal, draining");
                    shutdown.cancel();
                    break;
                }
                None => {
                    warn!("Signal stream ended");
                    break;
                }
            }
        }
    }))
}

#[cfg(unix)]
struct SignalStream {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalStream {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Option<SignalType> {
        tokio::select! {
            s = self.terminate.recv() => s.map(|_| SignalType::Shutdown),
            s = self.interrupt.recv() => s.map(|_| SignalType::Shutdown),
            s = self.hangup.recv() => s.map(|_| SignalType::Revalidate),
        }
    }
}

#[cfg(not(unix))]
struct SignalStream;

#[cfg(not(unix))]
impl SignalStream {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<SignalType> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|_| SignalType::Shutdown)
    }
}
