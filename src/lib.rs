//! zmesh-dataplane: service-mesh sidecar dataplane
//!
//! This crate provides the two halves of a mesh sidecar on Linux:
//! a transparent TCP proxy (one inbound and one outbound engine) and the
//! packet-filter controller that redirects pod traffic into it.
//!
//! # Features
//!
//! - **Transparent interception**: original destination recovered with `SO_ORIGINAL_DST`
//! - **Two modes**: `sidecar` (kernel destination) and `proxy` (fixed upstream)
//! - **Loop-free rule set**: proxy-owned and conn-marked flows are never re-captured
//! - **Connection Management**: admission limits, statistics and graceful drain
//!
//! # Architecture
//!
//! ```text
//! App → nat OUTPUT REDIRECT → outbound engine → upstream pod
//!                                                   ↓
//! upstream pod ← inbound engine ← nat PREROUTING REDIRECT ← remote client
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//! use zmesh_dataplane::config::load_config;
//! use zmesh_dataplane::interception::{InterceptionController, InterceptionRuleSet, IptablesFilter};
//! use zmesh_dataplane::proxy::{Direction, ProxyEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("./config/application.yaml")?;
//!
//! let controller = InterceptionController::new(
//!     IptablesFilter::new(config.interception.ipv6)?,
//!     InterceptionRuleSet::from_config(&config)?,
//! );
//! controller.install_all()?;
//!
//! let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//! let outbound = Arc::new(ProxyEngine::new(
//!     Direction::Outbound,
//!     config.outbound.clone(),
//!     &config.connection,
//! ));
//! outbound.start(&config.connection, shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Admission control, statistics and drain
//! - [`error`]: Error types
//! - [`interception`]: Packet-filter rule set, controller and simulator
//! - [`proxy`]: Resolver, connector, connection context and engines

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod interception;
pub mod proxy;

// Re-export commonly used types at the crate root
pub use config::{Config, ListenerConfig, Mode};
pub use connection::{ConnectionManager, ConnectionStats};
pub use error::{
    ConfigError, DataplaneError, DialError, ListenerError, RelayError, ResolutionError,
    RuleInstallError,
};
pub use interception::{InterceptionController, InterceptionRuleSet, PacketFilter};
pub use proxy::{Direction, ProxyEngine};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running as root (effective UID = 0)
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}
