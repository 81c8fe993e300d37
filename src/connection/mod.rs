//! Connection handling module
//!
//! This module provides per-engine connection bookkeeping:
//! - Connection limiting with immediate rejection
//! - Statistics collection
//! - Graceful shutdown with bounded drain

mod manager;
mod stats;

pub use manager::ConnectionManager;
pub use stats::{ConnectionStats, StatsSnapshot};
