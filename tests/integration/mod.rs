//! Integration tests for zmesh-dataplane
//!
//! # Test Organization
//!
//! - `proxy_e2e`: full accept loop on loopback with scripted resolvers and connectors
//! - `interception`: rule installation against the in-memory filter, packet
//!   classification properties, and an opt-in run against real iptables
//!
//! # Test Requirements
//!
//! - Proxy tests bind ephemeral loopback ports only
//! - Tests marked with `#[ignore]` need root (CAP_NET_ADMIN) and iptables

pub mod interception;
pub mod proxy_e2e;
