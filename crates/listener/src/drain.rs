//! In-flight connection tracking for graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Counts live connections and waits for them to finish at shutdown
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; it counts as active until the guard drops
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(active_connections = count, "Connection started");
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait for active connections to finish by `deadline`.
    ///
    /// Returns `false` if connections were still open at the deadline.
    pub async fn wait_for_drain(&self, deadline: Instant) -> bool {
        let start = Instant::now();
        let initial_count = self.active_count();

        info!(
            active_connections = initial_count,
            max_drain_time_secs = deadline.saturating_duration_since(start).as_secs(),
            "Starting connection drain"
        );

        let mut last_logged_count = initial_count;

        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    remaining_connections = self.active_count(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, connections still active"
                );
                return false;
            }

            let current_count = self.active_count();
            if current_count != last_logged_count {
                debug!(
                    remaining_connections = current_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Draining connections"
                );
                last_logged_count = current_count;
            }

            tokio::time::sleep_until(deadline.min(Instant::now() + DRAIN_POLL)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            initial_connections = initial_count,
            "All connections drained"
        );
        true
    }
}

/// Marks one connection as active while alive
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        trace!(active_connections = count, "Connection finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_guards_track_connections() {
        let tracker = ConnectionTracker::new();

        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(a);
        assert_eq!(tracker.active_count(), 1);
        drop(b);
        assert_eq!(tracker.active_count(), 0);

        assert!(tracker.wait_for_drain(in_secs(1)).await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_release() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(guard);
        });

        assert!(tracker.wait_for_drain(in_secs(5)).await);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();

        let started = Instant::now();
        assert!(!tracker.wait_for_drain(started + Duration::from_millis(200)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
