//! Proxy engine
//!
//! One engine per listener (inbound and outbound). Each accepted connection
//! gets its own driver task that feeds a closed set of [`Event`]s through
//! [`ProxyEngine::dispatch`]:
//!
//! ```text
//! accept -> Open -> (Traffic)* -> Close
//!           Opening  Relaying     Closing -> Closed
//! ```
//!
//! The upstream -> client direction runs in a separate relay task started
//! when the upstream dial completes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::connector::{TcpConnector, UpstreamConnector};
use super::context::{ConnectionContext, ConnectionState};
use super::listener::ProxyListener;
use super::relay::relay_to_client;
use super::resolver::{DestinationResolver, OriginalDstResolver};
use crate::config::{ConnectionConfig, DialPolicy, ListenerConfig, Mode};
use crate::connection::{ConnectionManager, StatsSnapshot};
use crate::error::{DataplaneError, RelayError};

/// Which side of the pod an engine serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Traffic arriving at the pod
    Inbound,
    /// Traffic leaving the pod
    Outbound,
}

impl Direction {
    /// Lowercase name used in logs and config sections
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client finished sending
    PeerEof,
    /// A resolution, dial or relay failure
    Error,
}

/// Connection events, handled in one place per engine
#[derive(Debug)]
pub enum Event<'a> {
    /// The connection was accepted; the stream is only used for destination lookup
    Open(&'a TcpStream),
    /// One batch of client bytes
    Traffic(&'a [u8]),
    /// Tear the connection down
    Close(CloseReason),
}

/// What the driver must do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep going
    None,
    /// Close the connection
    Close,
}

/// Proxy engine for one listener
pub struct ProxyEngine {
    direction: Direction,
    config: ListenerConfig,
    buffer_size: usize,
    resolver: Arc<dyn DestinationResolver>,
    connector: Arc<dyn UpstreamConnector>,
    connections: Arc<ConnectionManager>,

    /// Held across the check-and-dial sequence of on-demand dials
    dial_lock: tokio::sync::Mutex<()>,
}

impl ProxyEngine {
    /// Create an engine with the kernel resolver and a direct TCP connector
    pub fn new(
        direction: Direction,
        config: ListenerConfig,
        connection_config: &ConnectionConfig,
    ) -> Self {
        let connector = TcpConnector::with_routing_mark(config.routing_mark);
        Self {
            direction,
            config,
            buffer_size: connection_config.buffer_size,
            resolver: Arc::new(OriginalDstResolver::new()),
            connector: Arc::new(connector),
            connections: Arc::new(ConnectionManager::new(connection_config)),
            dial_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the destination resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the upstream connector
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Engine direction
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Listener mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Connection manager (admission and counters)
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Snapshot of the engine's counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.connections.stats_snapshot()
    }

    /// Validate the listener and bind its socket.
    ///
    /// # Errors
    ///
    /// Returns `DataplaneError::Config` for an invalid listener and
    /// `DataplaneError::Listener` if the socket cannot be bound.
    pub fn bind(&self, connection_config: &ConnectionConfig) -> Result<ProxyListener, DataplaneError> {
        self.config.validate(self.direction.as_str())?;
        let addr = self.config.listen_addr()?;
        Ok(ProxyListener::bind(addr, connection_config)?)
    }

    /// Bind and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails or the listener breaks irrecoverably.
    pub async fn start(
        self: Arc<Self>,
        connection_config: &ConnectionConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DataplaneError> {
        let listener = self.bind(connection_config)?;
        self.serve(listener, shutdown).await
    }

    /// Run the accept loop on an already bound listener.
    ///
    /// On shutdown the loop stops accepting and waits for in-flight
    /// connections to drain (bounded by the configured drain timeout).
    ///
    /// # Errors
    ///
    /// Returns `DataplaneError::Listener` if accept fails irrecoverably.
    pub async fn serve(
        self: Arc<Self>,
        listener: ProxyListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DataplaneError> {
        info!(
            "{} engine listening on {} (mode={}, dial_policy={:?})",
            self.direction,
            listener.local_addr(),
            self.config.mode,
            self.config.dial_policy
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("{} engine received shutdown signal", self.direction);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => self.spawn_connection(stream, client_addr),
                    Err(e) if e.is_recoverable() => {
                        warn!("{} accept failed: {}", self.direction, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => {
                        error!("{} listener failed: {}", self.direction, e);
                        return Err(e.into());
                    }
                }
            }
        }

        drop(listener);
        let remaining = self.connections.shutdown().await;
        if remaining > 0 {
            warn!(
                "{} engine abandoning {} connections after drain timeout",
                self.direction, remaining
            );
        }

        let stats = self.stats();
        info!(
            "{} engine stopped: accepted={}, completed={}, errored={}, rejected={}, bytes_up={}, bytes_down={}",
            self.direction,
            stats.total_accepted,
            stats.completed,
            stats.errored,
            stats.rejected,
            stats.bytes_up,
            stats.bytes_down
        );

        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, client_addr: SocketAddr) {
        let Some(permit) = self.connections.try_admit() else {
            debug!("Rejected connection from {}", client_addr);
            return;
        };

        let span = info_span!(
            "connection",
            direction = %self.direction,
            client = %client_addr,
            mode = %self.config.mode,
            destination = tracing::field::Empty,
        );

        let engine = Arc::clone(self);
        tokio::spawn(
            async move {
                engine.drive(stream, client_addr).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    /// Drive one accepted connection through its whole lifecycle.
    ///
    /// Returns the connection's context after it reached `Closed`.
    pub async fn drive(&self, stream: TcpStream, client_addr: SocketAddr) -> Arc<ConnectionContext> {
        let (mut reader, writer) = stream.into_split();
        let ctx = Arc::new(ConnectionContext::new(client_addr, writer));
        let stats = self.connections.stats();

        let reason = if self.dispatch(&ctx, Event::Open(reader.as_ref())).await == Action::Close {
            CloseReason::Error
        } else {
            let mut buf = vec![0u8; self.buffer_size];
            loop {
                let read = tokio::select! {
                    read = reader.read(&mut buf) => read,
                    () = ctx.relay_failed() => break CloseReason::Error,
                };
                match read {
                    Ok(0) => break CloseReason::PeerEof,
                    Ok(n) => {
                        if self.dispatch(&ctx, Event::Traffic(&buf[..n])).await == Action::Close {
                            break CloseReason::Error;
                        }
                    }
                    Err(e) => {
                        debug!("{}", RelayError::read("client", e));
                        break CloseReason::Error;
                    }
                }
            }
        };

        self.dispatch(&ctx, Event::Close(reason)).await;

        if let Some(relay) = ctx.take_relay() {
            if reason == CloseReason::Error {
                relay.abort();
            }
            let _ = relay.await;
        }
        ctx.transition(ConnectionState::Closed);

        match reason {
            CloseReason::PeerEof => stats.record_completed(),
            CloseReason::Error => stats.record_error(),
        }
        debug!("Connection closed ({:?})", reason);

        ctx
    }

    /// Handle one event. Errors are logged here and turned into `Action::Close`.
    pub async fn dispatch(&self, ctx: &Arc<ConnectionContext>, event: Event<'_>) -> Action {
        let result = match event {
            Event::Open(stream) => self.on_open(ctx, stream).await,
            Event::Traffic(data) => self.on_traffic(ctx, data).await,
            Event::Close(reason) => {
                self.on_close(ctx, reason).await;
                return Action::None;
            }
        };

        match result {
            Ok(()) => Action::None,
            Err(e) if e.is_connection_scoped() => {
                warn!(
                    client = %ctx.client_addr(),
                    destination = ?ctx.destination(),
                    mode = %self.config.mode,
                    "Closing connection: {}",
                    e
                );
                Action::Close
            }
            Err(e) => {
                error!(
                    client = %ctx.client_addr(),
                    destination = ?ctx.destination(),
                    mode = %self.config.mode,
                    "Closing connection on unexpected error: {}",
                    e
                );
                Action::Close
            }
        }
    }

    async fn on_open(
        &self,
        ctx: &Arc<ConnectionContext>,
        stream: &TcpStream,
    ) -> Result<(), DataplaneError> {
        let destination = self.select_destination(stream)?;
        ctx.set_destination(destination);
        Span::current().record("destination", tracing::field::display(destination));

        if self.config.dial_policy == DialPolicy::OnOpen && ctx.begin_dial() {
            self.dial(ctx, destination).await?;
        }

        ctx.transition(ConnectionState::Relaying);
        Ok(())
    }

    fn select_destination(&self, stream: &TcpStream) -> Result<SocketAddr, DataplaneError> {
        match self.config.mode {
            Mode::Proxy => Ok(self.config.target),
            Mode::Sidecar => self.resolver.resolve(stream).map_err(|e| {
                self.connections.stats().record_resolution_failure();
                e.into()
            }),
        }
    }

    async fn on_traffic(
        &self,
        ctx: &Arc<ConnectionContext>,
        data: &[u8],
    ) -> Result<(), DataplaneError> {
        if self.config.dial_policy == DialPolicy::OnFirstData {
            self.ensure_upstream(ctx).await?;
        }

        ctx.write_upstream(data).await?;
        self.connections.stats().add_bytes_up(data.len() as u64);
        Ok(())
    }

    /// On-demand dial: the first caller for a connection dials while holding
    /// the engine's dial lock, everyone else finds the dial already claimed.
    async fn ensure_upstream(&self, ctx: &Arc<ConnectionContext>) -> Result<(), DataplaneError> {
        let _guard = self.dial_lock.lock().await;
        if !ctx.begin_dial() {
            return Ok(());
        }

        let destination = ctx.destination().ok_or_else(|| RelayError::UpstreamMissing {
            destination: "<unresolved>".into(),
        })?;
        self.dial(ctx, destination).await
    }

    async fn dial(
        &self,
        ctx: &Arc<ConnectionContext>,
        destination: SocketAddr,
    ) -> Result<(), DataplaneError> {
        let upstream = self
            .connector
            .connect(destination, self.config.dial_timeout())
            .await
            .map_err(|e| {
                self.connections.stats().record_dial_failure();
                e
            })?;

        let (up_read, up_write) = upstream.into_split();
        if !ctx.install_upstream(up_write).await {
            // Torn down while dialing
            return Ok(());
        }

        let Some(client_writer) = ctx.take_client_writer() else {
            return Ok(());
        };

        let relay = tokio::spawn(
            relay_to_client(
                up_read,
                client_writer,
                Arc::clone(ctx),
                Arc::clone(self.connections.stats()),
            )
            .instrument(Span::current()),
        );
        ctx.set_relay(relay);

        debug!("Upstream {} connected", destination);
        Ok(())
    }

    async fn on_close(&self, ctx: &Arc<ConnectionContext>, reason: CloseReason) {
        ctx.transition(ConnectionState::Closing);
        ctx.close_upstream().await;
        debug!("Closing ({:?})", reason);
    }
}

impl fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("direction", &self.direction)
            .field("config", &self.config)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}
