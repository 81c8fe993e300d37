//! Connection statistics tracking
//!
//! Counters are kept per engine and logged at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic connection statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total connections accepted
    total_accepted: AtomicU64,
    /// Currently active connections
    active: AtomicU64,
    /// Connections that reached Closed without error
    completed: AtomicU64,
    /// Connections that closed because of an error
    errored: AtomicU64,
    /// Connections rejected due to limit
    rejected: AtomicU64,
    /// Original destination lookups that failed
    resolution_failures: AtomicU64,
    /// Upstream dials that failed
    dial_failures: AtomicU64,
    /// Bytes client -> upstream
    bytes_up: AtomicU64,
    /// Bytes upstream -> client
    bytes_down: AtomicU64,
}

impl ConnectionStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new accepted connection
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection that closed cleanly
    pub fn record_completed(&self) {
        self.release_active();
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection that closed on error
    pub fn record_error(&self) {
        self.release_active();
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement; connections driven without admission never
    /// incremented `active`
    fn release_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a rejected connection (due to limit)
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed original-destination lookup
    pub fn record_resolution_failure(&self) {
        self.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed upstream dial
    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes relayed client -> upstream
    pub fn add_bytes_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    /// Add bytes relayed upstream -> client
    pub fn add_bytes_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    /// Get currently active connections
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            active: self.active(),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub errored: u64,
    pub rejected: u64,
    pub resolution_failures: u64,
    pub dial_failures: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
