//! Upstream connection establishment
//!
//! The [`UpstreamConnector`] trait is the seam between the proxy engine and
//! the network: production uses [`TcpConnector`], tests substitute
//! recording or failing implementations.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DialError;

/// Opens TCP connections to upstream destinations.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect to `addr`, giving up after `connect_timeout`
    ///
    /// # Errors
    ///
    /// Returns `DialError` if the connection is refused, unreachable or times out.
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, DialError>;
}

/// Connects directly to the destination
///
/// Supports `routing_mark` (`SO_MARK`) so policy routing or packet-filter
/// rules can recognise the proxy's own upstream traffic.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    routing_mark: Option<u32>,
}

impl TcpConnector {
    /// Create a connector without a routing mark
    #[must_use]
    pub const fn new() -> Self {
        Self { routing_mark: None }
    }

    /// Create a connector that marks every upstream socket
    #[must_use]
    pub const fn with_routing_mark(routing_mark: Option<u32>) -> Self {
        Self { routing_mark }
    }

    /// Create a socket with the configured options
    fn create_socket(&self, addr: SocketAddr) -> Result<Socket, DialError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;

        if let Some(mark) = self.routing_mark {
            set_routing_mark(&socket, mark)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| DialError::socket_option("O_NONBLOCK", e.to_string()))?;

        // 60s idle before the first keepalive, then every 15s
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));

        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| DialError::socket_option("TCP_KEEPALIVE", e.to_string()))?;

        Ok(socket)
    }
}

/// Set `SO_MARK` for policy routing
fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), DialError> {
    let fd = socket.as_raw_fd();

    // SAFETY: fd is a live socket and mark outlives the call
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(DialError::socket_option(
            "SO_MARK",
            format!("Failed to set routing mark {mark}: {err}"),
        ));
    }

    debug!("Set routing mark: {}", mark);
    Ok(())
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        let socket = self.create_socket(addr)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(DialError::connection_failed(addr, e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;

        let connect_result = timeout(connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;

            // SO_ERROR carries the outcome of the handshake
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(DialError::connection_failed(addr, e.to_string())),
                Ok(None) => Ok(()),
            }
        })
        .await;

        match connect_result {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Upstream connection to {} established", addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::Timeout {
                addr,
                timeout: connect_timeout,
            }),
        }
    }
}
