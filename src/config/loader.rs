//! Configuration loading and management
//!
//! Bootstrap configuration is YAML by default; files ending in `.json` are
//! parsed as JSON. Environment variables can override a few fields.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::{Config, Mode};
use crate::error::ConfigError;

/// Locations searched when no configuration path is given
pub const DEFAULT_SEARCH_PATHS: &[&str] = &["./application.yaml", "./config/application.yaml"];

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML document
    Yaml,
    /// JSON document
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Load configuration from a file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config =
        parse_config(&contents, ConfigFormat::from_path(path)).map_err(|e| match e {
            ConfigError::ParseError(msg) => ConfigError::ParseError(format!("{msg} at {path:?}")),
            other => other,
        })?;

    config.validate()?;

    info!(
        "Configuration loaded: inbound {}:{} ({}), outbound {}:{} ({})",
        config.inbound.host,
        config.inbound.port,
        config.inbound.mode,
        config.outbound.host,
        config.outbound.port,
        config.outbound.mode
    );

    Ok(config)
}

/// Load configuration from a string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let config = parse_config(contents, format)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let parsed: Result<Config, String> = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| invalid_listener_mode(contents, format).unwrap_or(ConfigError::ParseError(e)))
}

/// Re-read a document that failed to deserialize and report a bad listener
/// mode as `InvalidMode` instead of a generic parse error
fn invalid_listener_mode(contents: &str, format: ConfigFormat) -> Option<ConfigError> {
    let value: serde_json::Value = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).ok()?,
        ConfigFormat::Json => serde_json::from_str(contents).ok()?,
    };
    ["inbound", "outbound"].iter().find_map(|listener| {
        let mode = value.get(listener)?.get("mode")?.as_str()?;
        mode.parse::<Mode>().err()
    })
}

/// Find the first existing file among [`DEFAULT_SEARCH_PATHS`]
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if none exists.
pub fn find_config() -> Result<PathBuf, ConfigError> {
    DEFAULT_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| ConfigError::FileNotFound {
            path: DEFAULT_SEARCH_PATHS.join(", "),
        })
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `ZMESH_INBOUND_PORT` / `ZMESH_OUTBOUND_PORT`: override listener ports
/// - `ZMESH_INBOUND_MODE` / `ZMESH_OUTBOUND_MODE`: override listener modes
/// - `ZMESH_LOG_LEVEL`: override log level
/// - `ZMESH_POD_CIDR`: override the mesh address range
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from a variable lookup, then re-validate
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparseable values, or a validation error.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("ZMESH_INBOUND_PORT") {
        config.inbound.port = parse_port("ZMESH_INBOUND_PORT", &port)?;
        debug!("Inbound port overridden to {}", config.inbound.port);
    }

    if let Some(port) = lookup("ZMESH_OUTBOUND_PORT") {
        config.outbound.port = parse_port("ZMESH_OUTBOUND_PORT", &port)?;
        debug!("Outbound port overridden to {}", config.outbound.port);
    }

    if let Some(mode) = lookup("ZMESH_INBOUND_MODE") {
        config.inbound.mode = mode.parse::<Mode>()?;
        debug!("Inbound mode overridden to {}", config.inbound.mode);
    }

    if let Some(mode) = lookup("ZMESH_OUTBOUND_MODE") {
        config.outbound.mode = mode.parse::<Mode>()?;
        debug!("Outbound mode overridden to {}", config.outbound.mode);
    }

    if let Some(level) = lookup("ZMESH_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(cidr) = lookup("ZMESH_POD_CIDR") {
        config.interception.pod_cidr = cidr.parse().map_err(|_| ConfigError::EnvError {
            name: "ZMESH_POD_CIDR".into(),
            reason: format!("Invalid CIDR: {cidr}"),
        })?;
        debug!("Pod CIDR overridden to {}", config.interception.pod_cidr);
    }

    config.validate()
}

fn parse_port(name: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvError {
        name: name.into(),
        reason: format!("Invalid port: {value}"),
    })
}

/// Write the default configuration to `path`
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let config = Config::default_config();
    let rendered = match ConfigFormat::from_path(path) {
        ConfigFormat::Yaml => serde_yaml::to_string(&config).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&config).map_err(|e| e.to_string()),
    }
    .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, rendered)?;
    Ok(())
}
