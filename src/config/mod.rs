//! Configuration module for the zmesh dataplane
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use zmesh_dataplane::config::load_config;
//!
//! let config = load_config("./config/application.yaml").unwrap();
//! println!("outbound mode: {}", config.outbound.mode);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, find_config, load_config, load_config_str,
    load_config_with_env, ConfigFormat, DEFAULT_SEARCH_PATHS,
};
pub use types::{
    Config, ConnectionConfig, DialPolicy, InterceptionConfig, ListenerConfig, LogConfig, Mode,
};
