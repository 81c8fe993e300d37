//! Per-connection state
//!
//! A [`ConnectionContext`] is created at accept time, shared between the
//! connection's driver and its upstream relay task, and dropped when both
//! are done. The upstream write half is the only field that more than one
//! task touches concurrently.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::RelayError;

/// Lifecycle of one proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; destination selection and dial in progress
    Opening,
    /// Client bytes are forwarded to the upstream
    Relaying,
    /// Tearing down both legs
    Closing,
    /// Both legs released
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opening => "opening",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Observable state of the upstream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Not dialed yet
    Absent,
    /// Connected and writable
    Present,
    /// Torn down; never becomes present again
    Closed,
}

enum UpstreamSlot {
    Absent,
    Present(OwnedWriteHalf),
    Closed,
}

impl UpstreamSlot {
    const fn state(&self) -> UpstreamState {
        match self {
            Self::Absent => UpstreamState::Absent,
            Self::Present(_) => UpstreamState::Present,
            Self::Closed => UpstreamState::Closed,
        }
    }
}

/// State of one accepted connection
pub struct ConnectionContext {
    client_addr: SocketAddr,

    /// Set once during `Opening`
    destination: OnceLock<SocketAddr>,

    /// Upstream write half; held across writes so relay teardown waits for them
    upstream: tokio::sync::Mutex<UpstreamSlot>,

    /// Set by the first dial attempt, successful or not
    dial_started: AtomicBool,

    /// Client write half, handed to the relay task once the upstream is up
    client_writer: Mutex<Option<OwnedWriteHalf>>,

    relay: Mutex<Option<JoinHandle<Result<u64, RelayError>>>>,

    /// Raised by the relay task when the upstream leg fails
    relay_failure: Notify,

    state: Mutex<ConnectionState>,
}

impl ConnectionContext {
    /// Create the context for a freshly accepted connection
    pub fn new(client_addr: SocketAddr, client_writer: OwnedWriteHalf) -> Self {
        Self {
            client_addr,
            destination: OnceLock::new(),
            upstream: tokio::sync::Mutex::new(UpstreamSlot::Absent),
            dial_started: AtomicBool::new(false),
            client_writer: Mutex::new(Some(client_writer)),
            relay: Mutex::new(None),
            relay_failure: Notify::new(),
            state: Mutex::new(ConnectionState::Opening),
        }
    }

    /// Remote address of the client
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Record the upstream destination. Returns `false` if one was already set.
    pub fn set_destination(&self, destination: SocketAddr) -> bool {
        self.destination.set(destination).is_ok()
    }

    /// Upstream destination, once selected
    #[must_use]
    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination.get().copied()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            trace!("state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Claim the right to dial. Only the first caller gets `true`.
    pub(crate) fn begin_dial(&self) -> bool {
        !self.dial_started.swap(true, Ordering::AcqRel)
    }

    /// Current upstream state
    pub async fn upstream_state(&self) -> UpstreamState {
        self.upstream.lock().await.state()
    }

    /// Store a freshly dialed upstream. Only succeeds from `Absent`.
    pub(crate) async fn install_upstream(&self, writer: OwnedWriteHalf) -> bool {
        let mut slot = self.upstream.lock().await;
        if matches!(*slot, UpstreamSlot::Absent) {
            *slot = UpstreamSlot::Present(writer);
            true
        } else {
            false
        }
    }

    /// Write one batch of client bytes to the upstream
    ///
    /// # Errors
    ///
    /// Returns `RelayError::UpstreamMissing` if no upstream is present, or
    /// `RelayError::Write` if the write fails.
    pub async fn write_upstream(&self, data: &[u8]) -> Result<(), RelayError> {
        let mut slot = self.upstream.lock().await;
        match &mut *slot {
            UpstreamSlot::Present(writer) => writer
                .write_all(data)
                .await
                .map_err(|e| RelayError::write("upstream", e)),
            UpstreamSlot::Absent | UpstreamSlot::Closed => Err(RelayError::UpstreamMissing {
                destination: self
                    .destination()
                    .map_or_else(|| "<unresolved>".to_string(), |d| d.to_string()),
            }),
        }
    }

    /// Send FIN to the upstream, if present, and mark the slot closed.
    /// Safe to call any number of times.
    pub async fn close_upstream(&self) {
        let mut slot = self.upstream.lock().await;
        if let UpstreamSlot::Present(writer) = &mut *slot {
            // Already-reset sockets fail here; the slot is cleared regardless
            let _ = writer.shutdown().await;
        }
        *slot = UpstreamSlot::Closed;
    }

    pub(crate) fn take_client_writer(&self) -> Option<OwnedWriteHalf> {
        self.client_writer.lock().take()
    }

    pub(crate) fn set_relay(&self, handle: JoinHandle<Result<u64, RelayError>>) {
        *self.relay.lock() = Some(handle);
    }

    pub(crate) fn take_relay(&self) -> Option<JoinHandle<Result<u64, RelayError>>> {
        self.relay.lock().take()
    }

    /// Wake the driver: the upstream leg broke
    pub(crate) fn signal_relay_failure(&self) {
        // notify_one keeps a permit when nobody is waiting yet
        self.relay_failure.notify_one();
    }

    /// Resolves once the relay task reported a failure
    pub(crate) async fn relay_failed(&self) {
        self.relay_failure.notified().await;
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("client_addr", &self.client_addr)
            .field("destination", &self.destination())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
