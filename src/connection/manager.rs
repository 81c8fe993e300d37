//! Connection Manager
//!
//! Per-engine admission control and shutdown drain:
//! - Connection limiting via semaphore permits
//! - Stop-accepting flag flipped by the shutdown signal
//! - Drain of in-flight connections bounded by `drain_timeout`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::stats::{ConnectionStats, StatsSnapshot};
use crate::config::ConnectionConfig;

/// Connection manager for one proxy engine
#[derive(Debug)]
pub struct ConnectionManager {
    /// Semaphore for connection limiting
    semaphore: Arc<Semaphore>,

    /// Maximum connections allowed
    max_connections: usize,

    /// Connection statistics
    stats: Arc<ConnectionStats>,

    /// Drain timeout for graceful shutdown
    drain_timeout: Duration,

    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            stats: Arc::new(ConnectionStats::new()),
            drain_timeout: config.drain_timeout(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Try to admit a new connection.
    ///
    /// Returns `None` when the limit is reached or shutdown has started; the
    /// caller must close the connection. The permit is held for the whole
    /// connection lifetime.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        if self.is_shutting_down() {
            self.stats.record_rejected();
            return None;
        }

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats.record_accepted();
                Some(permit)
            }
            Err(_) => {
                self.stats.record_rejected();
                warn!(
                    "Connection limit reached ({}/{}), rejecting",
                    self.active_connections(),
                    self.max_connections
                );
                None
            }
        }
    }

    /// Get shared statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Get current active connection count
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Get the configured connection limit
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Check if shutting down
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Stop admitting connections and wait for in-flight ones to finish.
    ///
    /// Returns the number of connections still active when the drain
    /// timeout expired (0 on a clean drain). Calling it twice is harmless.
    pub async fn shutdown(&self) -> usize {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return self.active_connections();
        }

        info!("Stopping admission, draining connections");

        let drain_start = Instant::now();
        let check_interval = Duration::from_millis(100);

        while drain_start.elapsed() < self.drain_timeout {
            let active = self.active_connections();
            if active == 0 {
                info!("All connections drained");
                return 0;
            }

            debug!(
                "Waiting for {} connections to drain ({:.1}s remaining)",
                active,
                (self.drain_timeout - drain_start.elapsed()).as_secs_f64()
            );

            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            warn!(
                "Drain timeout reached with {} connections still active",
                remaining
            );
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_manager(max_connections: usize) -> ConnectionManager {
        let config = ConnectionConfig {
            max_connections,
            drain_timeout_secs: 1,
            ..ConnectionConfig::default()
        };
        ConnectionManager::new(&config)
    }

    #[test]
    fn test_manager_creation() {
        let manager = create_test_manager(10);
        assert_eq!(manager.max_connections(), 10);
        assert_eq!(manager.active_connections(), 0);
    }

    #[test]
    fn test_limit_rejects() {
        let manager = create_test_manager(1);
        let first = manager.try_admit();
        assert!(first.is_some());
        assert!(manager.try_admit().is_none());
        assert_eq!(manager.stats_snapshot().rejected, 1);

        drop(first);
        assert!(manager.try_admit().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops_admission() {
        let manager = create_test_manager(4);
        assert_eq!(manager.shutdown().await, 0);
        assert!(manager.is_shutting_down());
        assert!(manager.try_admit().is_none());

        // Double shutdown should be safe
        assert_eq!(manager.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_stragglers() {
        let manager = create_test_manager(4);
        let _held = manager.try_admit().unwrap();
        assert_eq!(manager.shutdown().await, 1);
    }
}
