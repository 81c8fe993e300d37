//! Error types for the zmesh dataplane
//!
//! Errors are grouped by subsystem. Connection-scoped errors
//! (`ResolutionError`, `DialError`, `RelayError`) never escape the connection
//! they belong to; `ConfigError` and `ListenerError` abort engine startup;
//! `RuleInstallError` is surfaced to whoever drives the interception controller.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the dataplane
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Configuration errors (file parsing, validation, invalid mode)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener socket errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Original destination could not be recovered
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Upstream dial errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Mid-stream relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Packet-filter rule installation errors
    #[error("Rule install error: {0}")]
    RuleInstall(#[from] RuleInstallError),
}

impl DataplaneError {
    /// Check if this error is recoverable (the operation may be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Listener(e) => e.is_recoverable(),
            Self::Resolution(e) => e.is_recoverable(),
            Self::Dial(e) => e.is_recoverable(),
            Self::Relay(e) => e.is_recoverable(),
            Self::RuleInstall(e) => e.is_recoverable(),
        }
    }

    /// Whether the error is scoped to a single connection
    #[must_use]
    pub const fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Dial(_) | Self::Relay(_))
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML/JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Listener mode outside `{proxy, sidecar}`
    #[error("Invalid mode '{0}', only 'proxy' and 'sidecar' are supported")]
    InvalidMode(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Listener socket errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to create socket
    #[error("Failed to create listener socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to accept connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// I/O error
    #[error("Listener I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ListenerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_) | Self::SocketOption { .. } | Self::BindError { .. } => false,
            Self::AcceptError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Failure to recover the pre-redirection destination of a connection
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The socket carries no NAT record (connection was not redirected)
    #[error("No original destination recorded for this socket (not redirected?): {0}")]
    NotRedirected(String),

    /// The platform or address family cannot be queried
    #[error("Original destination lookup unsupported: {0}")]
    Unsupported(String),

    /// getsockopt failed for another reason
    #[error("getsockopt {option} failed: {reason}")]
    Syscall { option: &'static str, reason: String },

    /// The kernel returned an unspecified address or port zero
    #[error("Original destination is empty ({0})")]
    Empty(SocketAddr),
}

impl ResolutionError {
    /// Resolution is never retried on the same connection
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Upstream dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// Connection failed (refused, unreachable, reset during handshake)
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    /// Connection timed out
    #[error("Connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    /// Failed to set an upstream socket option (`SO_MARK`, keepalive)
    #[error("Failed to set upstream socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error during connection
    #[error("Dial I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DialError {
    /// Dials are not retried; the flag only classifies transient failures for logging
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::SocketOption { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Mid-stream relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Client data arrived while no upstream handle was present
    #[error("Upstream to {destination} is not connected")]
    UpstreamMissing { destination: String },

    /// Read from one leg failed
    #[error("Read from {leg} failed: {source}")]
    Read {
        leg: &'static str,
        #[source]
        source: io::Error,
    },

    /// Write to one leg failed
    #[error("Write to {leg} failed: {source}")]
    Write {
        leg: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// A broken relay always tears the connection down
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a read error
    pub const fn read(leg: &'static str, source: io::Error) -> Self {
        Self::Read { leg, source }
    }

    /// Create a write error
    pub const fn write(leg: &'static str, source: io::Error) -> Self {
        Self::Write { leg, source }
    }
}

/// Packet-filter primitive failures
#[derive(Debug, Error)]
pub enum RuleInstallError {
    /// A packet-filter primitive returned an error
    #[error("{op} on {table}/{chain} failed: {reason}")]
    Backend {
        op: &'static str,
        table: String,
        chain: String,
        reason: String,
    },

    /// A capture rule set references a chain that has not been created
    #[error("Chain {table}/{chain} does not exist, install baseline rules first")]
    MissingChain { table: String, chain: String },

    /// The packet-filter binary could not be initialised
    #[error("Packet filter unavailable: {0}")]
    Unavailable(String),
}

impl RuleInstallError {
    /// Every operation is idempotent, so a backend failure may simply be retried
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }

    /// Create a backend error
    pub fn backend(
        op: &'static str,
        table: impl Into<String>,
        chain: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Backend {
            op,
            table: table.into(),
            chain: chain.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `DataplaneError`
pub type Result<T> = std::result::Result<T, DataplaneError>;
