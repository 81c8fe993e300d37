//! Configuration types for the zmesh dataplane
//!
//! The bootstrap file describes the two listeners (inbound and outbound),
//! connection limits, the interception rule set and logging. Everything is
//! validated once at startup; invalid values are fatal.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Inbound listener (traffic arriving at this pod)
    pub inbound: ListenerConfig,

    /// Outbound listener (traffic leaving this pod)
    pub outbound: ListenerConfig,

    /// Connection limits and drain behaviour
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Packet-filter rule set
    #[serde(default)]
    pub interception: InterceptionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inbound.validate("inbound")?;
        self.outbound.validate("outbound")?;

        if self.inbound.port == self.outbound.port {
            return Err(ConfigError::ValidationError(format!(
                "inbound and outbound listeners cannot share port {}",
                self.inbound.port
            )));
        }

        self.connection.validate()?;
        self.interception.validate()?;

        Ok(())
    }

    /// Configuration matching the reference sidecar deployment
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            inbound: ListenerConfig::new("0.0.0.0", 8091, Mode::Sidecar),
            outbound: ListenerConfig::new("0.0.0.0", 8090, Mode::Sidecar),
            connection: ConnectionConfig::default(),
            interception: InterceptionConfig {
                proxy_uid: Some(1337),
                ..InterceptionConfig::default()
            },
            log: LogConfig::default(),
        }
    }
}

/// How a listener picks the upstream for each accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mode {
    /// Forward every connection to one statically configured target
    Proxy,
    /// Recover the original destination from kernel NAT state
    Sidecar,
}

impl Mode {
    /// Dial timeout used when the listener does not override it
    #[must_use]
    pub const fn default_dial_timeout(self) -> Duration {
        match self {
            Self::Sidecar => Duration::from_secs(5),
            Self::Proxy => Duration::from_secs(10),
        }
    }

    /// Lowercase name as it appears in configuration
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Sidecar => "sidecar",
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "sidecar" => Ok(Self::Sidecar),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the upstream connection is established
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialPolicy {
    /// Dial as soon as the client connection is accepted
    #[default]
    OnOpen,
    /// Dial when the first batch of client bytes arrives
    OnFirstData,
}

/// One proxy listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listen host (IP literal or resolvable name)
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Destination selection mode, fixed for the listener's lifetime
    pub mode: Mode,

    /// Static upstream used in proxy mode
    #[serde(default = "default_target")]
    pub target: SocketAddr,

    /// Upstream dial timeout in milliseconds (defaults per mode)
    #[serde(default)]
    pub dial_timeout_ms: Option<u64>,

    /// When to dial the upstream
    #[serde(default)]
    pub dial_policy: DialPolicy,

    /// `SO_MARK` applied to upstream sockets
    #[serde(default)]
    pub routing_mark: Option<u32>,
}

impl ListenerConfig {
    /// Create a listener config with defaults for the optional fields
    pub fn new(host: impl Into<String>, port: u16, mode: Mode) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
            target: default_target(),
            dial_timeout_ms: None,
            dial_policy: DialPolicy::default(),
            routing_mark: None,
        }
    }

    /// Validate the listener
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{name}: host cannot be empty"
            )));
        }

        if self.port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}: port must be greater than 0"
            )));
        }

        if self.dial_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "{name}: dial_timeout_ms must be greater than 0"
            )));
        }

        if self.mode == Mode::Proxy && self.target.port() == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}: proxy mode requires a target with a non-zero port"
            )));
        }

        Ok(())
    }

    /// Effective dial timeout
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout_ms
            .map_or_else(|| self.mode.default_dial_timeout(), Duration::from_millis)
    }

    /// Resolve `host:port` into a bindable socket address
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the host cannot be resolved.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                ConfigError::ValidationError(format!("cannot resolve host '{}': {e}", self.host))
            })?
            .next()
            .ok_or_else(|| {
                ConfigError::ValidationError(format!("host '{}' has no addresses", self.host))
            })
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent connections per listener
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Read buffer size for the client leg
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Graceful shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Enable `SO_REUSEPORT` on listeners
    #[serde(default = "default_true")]
    pub reuse_port: bool,
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be greater than 0".into(),
            ));
        }

        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "backlog must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            drain_timeout_secs: default_drain_timeout_secs(),
            backlog: default_backlog(),
            reuse_port: true,
        }
    }
}

/// Packet-filter rule set parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptionConfig {
    /// Mesh pod address range
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: IpNet,

    /// Connection-tracking mark set on outbound mesh flows
    #[serde(default = "default_conntrack_mark")]
    pub conntrack_mark: u32,

    /// UID the proxy runs as (defaults to the current effective UID)
    #[serde(default)]
    pub proxy_uid: Option<u32>,

    /// nat chain holding outbound capture rules
    #[serde(default = "default_output_chain")]
    pub output_chain: String,

    /// nat chain holding inbound capture rules
    #[serde(default = "default_prerouting_chain")]
    pub prerouting_chain: String,

    /// mangle chain holding the connection-mark rule
    #[serde(default = "default_mark_chain")]
    pub mark_chain: String,

    /// Drive ip6tables instead of iptables
    #[serde(default)]
    pub ipv6: bool,
}

impl InterceptionConfig {
    /// Validate interception configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conntrack_mark == 0 {
            return Err(ConfigError::ValidationError(
                "conntrack_mark must be non-zero".into(),
            ));
        }

        if self.ipv6 != matches!(self.pod_cidr, IpNet::V6(_)) {
            return Err(ConfigError::ValidationError(format!(
                "pod_cidr {} does not match ipv6={}",
                self.pod_cidr, self.ipv6
            )));
        }

        let chains = [&self.output_chain, &self.prerouting_chain, &self.mark_chain];
        for chain in chains {
            // iptables limits chain names to 28 characters
            if chain.is_empty() || chain.len() > 28 || chain.contains(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid chain name '{chain}'"
                )));
            }
        }

        if self.output_chain == self.prerouting_chain {
            return Err(ConfigError::ValidationError(
                "output_chain and prerouting_chain must differ".into(),
            ));
        }

        Ok(())
    }

    /// UID excluded from outbound capture.
    ///
    /// Falls back to the current effective UID when `proxy_uid` is unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when `proxy_uid` is unset and
    /// the caller runs as root. The rules are installed as root, but the proxy
    /// must not be, or every root process would bypass capture.
    pub fn effective_proxy_uid(&self) -> Result<u32, ConfigError> {
        self.proxy_uid_for(current_euid())
    }

    fn proxy_uid_for(&self, euid: u32) -> Result<u32, ConfigError> {
        match self.proxy_uid {
            Some(uid) => Ok(uid),
            None if euid == 0 => Err(ConfigError::ValidationError(
                "interception.proxy_uid must be set when installing rules as root".into(),
            )),
            None => Ok(euid),
        }
    }
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            pod_cidr: default_pod_cidr(),
            conntrack_mark: default_conntrack_mark(),
            proxy_uid: None,
            output_chain: default_output_chain(),
            prerouting_chain: default_prerouting_chain(),
            mark_chain: default_mark_chain(),
            ipv6: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

fn current_euid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() }
}

const fn default_true() -> bool {
    true
}

fn default_target() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

const fn default_max_connections() -> usize {
    10240
}

const fn default_buffer_size() -> usize {
    64 * 1024
}

const fn default_drain_timeout_secs() -> u64 {
    5
}

const fn default_backlog() -> u32 {
    1024
}

fn default_pod_cidr() -> IpNet {
    IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(10, 10, 0, 0), 16))
}

const fn default_conntrack_mark() -> u32 {
    0x1
}

fn default_output_chain() -> String {
    "MESH_OUTPUT".into()
}

fn default_prerouting_chain() -> String {
    "MESH_PREROUTING".into()
}

fn default_mark_chain() -> String {
    "MESH_MARK".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
