//! Proxy TCP listener
//!
//! Binds the plain TCP socket that the packet filter's REDIRECT rules point
//! at. Destination recovery is not done here; the engine asks the resolver
//! once the connection reaches `Open`.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::ListenerError;

/// A TCP listener for one proxy engine
#[derive(Debug)]
pub struct ProxyListener {
    /// The underlying tokio TCP listener
    listener: TcpListener,

    /// Bound address (with the real port when 0 was requested)
    local_addr: SocketAddr,
}

impl ProxyListener {
    /// Create and bind a new listener.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError` if:
    /// - Socket creation fails
    /// - A socket option cannot be set
    /// - Binding fails (address in use, permission denied)
    pub fn bind(addr: SocketAddr, config: &ConnectionConfig) -> Result<Self, ListenerError> {
        let socket = create_listener_socket(addr, config.reuse_port)?;

        socket
            .bind(&addr.into())
            .map_err(|e| ListenerError::bind(addr, e.to_string()))?;

        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| ListenerError::socket_option("listen", e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ListenerError::SocketCreation(e.to_string()))?;

        let local_addr = listener.local_addr()?;

        info!(
            "Proxy listener ready on {} (backlog={})",
            local_addr, config.backlog
        );

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next connection.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::AcceptError` if accept fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ListenerError::AcceptError(e.to_string()))?;

        debug!("Accepted connection from {}", client_addr);
        Ok((stream, client_addr))
    }

    /// Get the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn create_listener_socket(addr: SocketAddr, reuse_port: bool) -> Result<Socket, ListenerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ListenerError::SocketCreation(e.to_string()))?;

    // Quick restart
    socket
        .set_reuse_address(true)
        .map_err(|e| ListenerError::socket_option("SO_REUSEADDR", e.to_string()))?;

    if reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(|e| ListenerError::socket_option("SO_REUSEPORT", e.to_string()))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| ListenerError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created listener socket for {}", addr);
    Ok(socket)
}
