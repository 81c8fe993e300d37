//! Original destination recovery
//!
//! When the packet filter redirects a connection to the local listener, the
//! kernel's NAT table still knows where the client was actually going. This
//! module reads it back with `SO_ORIGINAL_DST` (IPv4) or
//! `IP6T_SO_ORIGINAL_DST` (IPv6).

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::net::TcpStream;

use crate::error::ResolutionError;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP6T_SO_ORIGINAL_DST` (`SOL_IPV6` level)
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Recovers the pre-redirection destination of an accepted connection.
///
/// Implementations must be safe to call concurrently for different
/// connections. Resolution happens exactly once per connection.
pub trait DestinationResolver: Send + Sync {
    /// Look up the original destination of `stream`
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError` if no usable destination is recorded.
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr, ResolutionError>;
}

/// Resolver backed by the kernel's NAT connection-tracking table
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDstResolver;

impl OriginalDstResolver {
    /// Create a new resolver
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DestinationResolver for OriginalDstResolver {
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        let fd = stream.as_raw_fd();
        let local = stream
            .local_addr()
            .map_err(|e| ResolutionError::Unsupported(format!("local_addr: {e}")))?;

        let addr = match local {
            SocketAddr::V4(_) => get_original_dst(fd)?,
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                // Dual-stack listener accepting an IPv4 client
                Some(_) => get_original_dst(fd)?,
                None => get_original_dst_v6(fd)?,
            },
        };

        check_not_empty(addr)
    }
}

/// Reject an unspecified address or port zero
///
/// # Errors
///
/// Returns `ResolutionError::Empty` for such addresses.
pub fn check_not_empty(addr: SocketAddr) -> Result<SocketAddr, ResolutionError> {
    if addr.ip().is_unspecified() || addr.port() == 0 {
        return Err(ResolutionError::Empty(addr));
    }
    Ok(addr)
}

fn map_getsockopt_error(option: &'static str, err: io::Error) -> ResolutionError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => ResolutionError::NotRedirected(err.to_string()),
        Some(libc::ENOPROTOOPT) => {
            ResolutionError::Unsupported(format!("{option} not available: {err}"))
        }
        _ => ResolutionError::Syscall {
            option,
            reason: err.to_string(),
        },
    }
}

/// Get the original destination of a redirected IPv4 TCP connection.
///
/// # Errors
///
/// Returns `ResolutionError` if the getsockopt call fails.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, ResolutionError> {
    // SAFETY: sockaddr_in is plain old data
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: addr and len are valid for writes and len holds addr's size
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &raw mut len,
        )
    };

    if ret != 0 {
        return Err(map_getsockopt_error(
            "SO_ORIGINAL_DST",
            io::Error::last_os_error(),
        ));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));

    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Get the original destination of a redirected IPv6 TCP connection.
///
/// # Errors
///
/// Returns `ResolutionError` if the getsockopt call fails.
pub fn get_original_dst_v6(fd: RawFd) -> Result<SocketAddr, ResolutionError> {
    // SAFETY: sockaddr_in6 is plain old data
    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

    // SAFETY: addr and len are valid for writes and len holds addr's size
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            IP6T_SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &raw mut len,
        )
    };

    if ret != 0 {
        return Err(map_getsockopt_error(
            "IP6T_SO_ORIGINAL_DST",
            io::Error::last_os_error(),
        ));
    }

    let port = u16::from_be(addr.sin6_port);
    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);

    Ok(SocketAddr::V6(SocketAddrV6::new(
        ip,
        port,
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_not_empty() {
        let ok: SocketAddr = "203.0.113.5:9000".parse().unwrap();
        assert_eq!(check_not_empty(ok).unwrap(), ok);

        let zero_ip: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        assert!(matches!(
            check_not_empty(zero_ip),
            Err(ResolutionError::Empty(_))
        ));

        let zero_port: SocketAddr = "203.0.113.5:0".parse().unwrap();
        assert!(matches!(
            check_not_empty(zero_port),
            Err(ResolutionError::Empty(_))
        ));

        let zero_v6: SocketAddr = "[::]:443".parse().unwrap();
        assert!(check_not_empty(zero_v6).is_err());
    }

    #[test]
    fn test_invalid_fd_is_syscall_error() {
        let err = get_original_dst(-1).unwrap_err();
        assert!(matches!(err, ResolutionError::Syscall { .. }));
    }
}
