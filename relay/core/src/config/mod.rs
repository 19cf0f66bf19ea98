//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from a TOML file at
//! `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/relay/relay.toml` (typically `~/.config/relay/relay.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7878"
//!
//! [session]
//! idle_timeout_secs = 120   # 0 disables the watchdog
//!
//! [client]
//! reconnect_attempts = 5
//! reconnect_delay_ms = 250
//! connect_timeout_ms = 10000
//!
//! [backend]
//! ollama_host = "localhost"
//! ollama_port = 11434
//! default_model = "llama3.2"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::registry::RegistryConfig;

/// Default listen address of the daemon
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7878";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address the daemon listens on
    pub listen: Option<String>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Producer idle timeout in seconds (0 = disabled)
    pub idle_timeout_secs: Option<u64>,
}

/// Client section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Number of reconnection attempts
    pub reconnect_attempts: Option<u32>,

    /// Base delay between reconnection attempts in milliseconds
    pub reconnect_delay_ms: Option<u64>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub ollama_host: Option<String>,

    /// Ollama port
    pub ollama_port: Option<u16>,

    /// Model used when a request does not name one
    pub default_model: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Session configuration section
    pub session: SessionToml,

    /// Client configuration section
    pub client: ClientToml,

    /// Backend configuration section
    pub backend: BackendToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Daemon listen address
    pub listen: String,

    /// Session registry settings
    pub registry: RegistryConfig,

    /// Resumable client settings
    pub client: ClientConfig,

    /// Ollama host
    pub ollama_host: String,

    /// Ollama port
    pub ollama_port: u16,

    /// Model used when a request does not name one
    pub default_model: String,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            registry: RegistryConfig::default(),
            client: ClientConfig::default(),
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            default_model: "llama3.2".to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }
}

fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref listen) = toml.server.listen {
        if listen.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.listen must not be empty".to_string(),
            ));
        }
        config.listen.clone_from(listen);
    }

    // Session settings
    if let Some(secs) = toml.session.idle_timeout_secs {
        config.registry.idle_timeout = idle_timeout_from_secs(secs);
    }

    // Client settings
    if let Some(attempts) = toml.client.reconnect_attempts {
        config.client.reconnect_attempts = attempts;
    }
    if let Some(delay) = toml.client.reconnect_delay_ms {
        config.client.reconnect_delay = Duration::from_millis(delay);
    }
    if let Some(timeout) = toml.client.connect_timeout_ms {
        if timeout == 0 {
            return Err(ConfigError::ValidationError(
                "client.connect_timeout_ms must be positive".to_string(),
            ));
        }
        config.client.connect_timeout = Duration::from_millis(timeout);
    }

    // Backend settings
    if let Some(ref host) = toml.backend.ollama_host {
        config.ollama_host.clone_from(host);
    }
    if let Some(port) = toml.backend.ollama_port {
        config.ollama_port = port;
    }
    if let Some(ref model) = toml.backend.default_model {
        config.default_model.clone_from(model);
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; unparsable values are ignored.
fn apply_env_config(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(listen) = lookup("RELAY_LISTEN") {
        config.listen = listen;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = lookup("RELAY_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.registry.idle_timeout = idle_timeout_from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(attempts) = lookup("RELAY_RECONNECT_ATTEMPTS") {
        if let Ok(n) = attempts.parse::<u32>() {
            config.client.reconnect_attempts = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(delay) = lookup("RELAY_RECONNECT_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.client.reconnect_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(model) = lookup("RELAY_DEFAULT_MODEL") {
        config.default_model = model;
        config.source = ConfigSource::Env;
    }

    // Same variables the Ollama CLI reads
    if let Some(host) = lookup("OLLAMA_HOST") {
        config.ollama_host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = lookup("OLLAMA_PORT") {
        if let Ok(port) = port.parse::<u16>() {
            config.ollama_port = port;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen: Option<String>,

    /// Idle timeout override (seconds, 0 = disabled)
    pub idle_timeout_secs: Option<u64>,

    /// Default model override
    pub default_model: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen(mut self, listen: String) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.listen.is_some() || self.idle_timeout_secs.is_some() || self.default_model.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref listen) = self.listen {
            config.listen.clone_from(listen);
        }

        if let Some(secs) = self.idle_timeout_secs {
            config.registry.idle_timeout = idle_timeout_from_secs(secs);
        }

        if let Some(ref model) = self.default_model {
            config.default_model.clone_from(model);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
