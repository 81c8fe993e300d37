//! Transparent TCP proxy
//!
//! This module provides the two proxy engines and their collaborators:
//!
//! - [`DestinationResolver`]: recovers the pre-redirection destination
//! - [`UpstreamConnector`]: dials the upstream with a timeout
//! - [`ConnectionContext`]: per-connection state shared with the relay task
//! - [`ProxyEngine`]: accept loop and per-connection state machine
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//! use zmesh_dataplane::config::Config;
//! use zmesh_dataplane::proxy::{Direction, ProxyEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default_config();
//! let (_tx, rx) = broadcast::channel(1);
//! let engine = Arc::new(ProxyEngine::new(
//!     Direction::Outbound,
//!     config.outbound.clone(),
//!     &config.connection,
//! ));
//! engine.start(&config.connection, rx).await?;
//! # Ok(())
//! # }
//! ```

mod connector;
mod context;
mod engine;
mod listener;
mod relay;
mod resolver;

pub use connector::{TcpConnector, UpstreamConnector};
pub use context::{ConnectionContext, ConnectionState, UpstreamState};
pub use engine::{Action, CloseReason, Direction, Event, ProxyEngine};
pub use listener::ProxyListener;
pub use relay::relay_to_client;
pub use resolver::{
    check_not_empty, get_original_dst, get_original_dst_v6, DestinationResolver,
    OriginalDstResolver, IP6T_SO_ORIGINAL_DST, SO_ORIGINAL_DST,
};
