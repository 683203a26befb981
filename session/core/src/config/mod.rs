//! TOML Configuration File Support
//!
//! Client configuration lives at `~/.config/chat-session/client.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! url = "https://chat.example.com"
//!
//! [transport]
//! transports = ["websocket", "polling"]
//! reconnect_attempts = 5
//! reconnect_delay_ms = 1000
//! connect_timeout_ms = 20000
//!
//! [session]
//! turn_timeout_ms = 120000
//! max_title_chars = 40
//! stopped_message = "Message stopped."
//!
//! [storage]
//! path = "/home/me/.local/share/chat-session/storage.json"
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::TitleDefaults;
use crate::storage::FileStore;
use crate::transport::config::{parse_transport_list, TransportConfig, TransportKind};

/// Default text of the marker appended when generation is stopped
pub const DEFAULT_STOPPED_MESSAGE: &str = "Message stopped.";

/// Default per-turn deadline in milliseconds
pub const DEFAULT_TURN_TIMEOUT_MS: u64 = 120_000;

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

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
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

/// `[backend]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Backend base URL
    pub url: Option<String>,
}

/// `[transport]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Mount path of the real-time endpoint
    pub path: Option<String>,
    /// Transport names in preference order
    pub transports: Option<Vec<String>>,
    /// Whether to reconnect after a lost connection
    pub reconnection: Option<bool>,
    /// Reconnection attempts
    pub reconnect_attempts: Option<u32>,
    /// Delay between attempts in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Per-turn deadline in milliseconds (0 disables)
    pub turn_timeout_ms: Option<u64>,
    /// Characters kept in derived titles
    pub max_title_chars: Option<usize>,
    /// Placeholder title of new stored conversations
    pub new_conversation_title: Option<String>,
    /// Placeholder title of guest conversations
    pub guest_conversation_title: Option<String>,
    /// Text of the stopped marker
    pub stopped_message: Option<String>,
}

/// `[storage]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Local store file
    pub path: Option<PathBuf>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// `[backend]`
    pub backend: BackendToml,
    /// `[transport]`
    pub transport: TransportToml,
    /// `[session]`
    pub session: SessionToml,
    /// `[storage]`
    pub storage: StorageToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Session behaviour settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-turn deadline in milliseconds; 0 disables the deadline
    pub turn_timeout_ms: u64,
    /// Placeholder titles and derived-title length
    pub titles: TitleDefaults,
    /// Text of the stopped marker
    pub stopped_message: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: DEFAULT_TURN_TIMEOUT_MS,
            titles: TitleDefaults::default(),
            stopped_message: DEFAULT_STOPPED_MESSAGE.to_string(),
        }
    }
}

impl SessionConfig {
    /// The turn deadline, or `None` when disabled
    #[must_use]
    pub fn turn_timeout(&self) -> Option<std::time::Duration> {
        (self.turn_timeout_ms > 0).then(|| std::time::Duration::from_millis(self.turn_timeout_ms))
    }
}

/// Fully resolved client configuration
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Real-time transport settings; `transport.url` is the backend URL
    pub transport: TransportConfig,
    /// Session behaviour
    pub session: SessionConfig,
    /// Local store file, `None` for the platform default
    pub storage_path: Option<PathBuf>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
            storage_path: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ChatConfig {
    /// Backend base URL, shared by REST and real-time clients
    #[must_use]
    pub fn backend_url(&self) -> &str {
        &self.transport.url
    }

    /// Local store file, falling back to the platform data directory
    #[must_use]
    pub fn resolved_storage_path(&self) -> Option<PathBuf> {
        self.storage_path.clone().or_else(FileStore::default_path)
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the session cannot work with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty transport list, a
    /// backend URL that is not http(s), or a zero title length.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.transports.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one transport is required".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&self.transport.url).map_err(|e| {
            ConfigError::ValidationError(format!("backend url {}: {e}", self.transport.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "backend url must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.session.titles.max_title_chars == 0 {
            return Err(ConfigError::ValidationError(
                "max_title_chars must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-session/client.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-session").join("client.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing file is not an error.
pub fn load_config() -> Result<ChatConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ChatConfig, ConfigError> {
    let mut config = ChatConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ChatToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_transports(names: &[String]) -> Result<Vec<TransportKind>, ConfigError> {
    names
        .iter()
        .map(|name| TransportKind::from_str(name).map_err(ConfigError::ValidationError))
        .collect()
}

fn apply_toml_config(config: &mut ChatConfig, toml: &ChatToml) -> Result<(), ConfigError> {
    if let Some(ref url) = toml.backend.url {
        config.transport.url.clone_from(url);
    }

    let transport = &toml.transport;
    if let Some(ref path) = transport.path {
        config.transport.path.clone_from(path);
    }
    if let Some(ref names) = transport.transports {
        config.transport.transports = parse_transports(names)?;
    }
    if let Some(enabled) = transport.reconnection {
        config.transport.reconnection = enabled;
    }
    if let Some(attempts) = transport.reconnect_attempts {
        config.transport.reconnect_attempts = attempts;
    }
    if let Some(delay) = transport.reconnect_delay_ms {
        config.transport.reconnect_delay_ms = delay;
    }
    if let Some(timeout) = transport.connect_timeout_ms {
        config.transport.connect_timeout_ms = timeout;
    }

    let session = &toml.session;
    if let Some(timeout) = session.turn_timeout_ms {
        config.session.turn_timeout_ms = timeout;
    }
    if let Some(chars) = session.max_title_chars {
        config.session.titles.max_title_chars = chars;
    }
    if let Some(ref title) = session.new_conversation_title {
        config.session.titles.new_conversation.clone_from(title);
    }
    if let Some(ref title) = session.guest_conversation_title {
        config.session.titles.guest_conversation.clone_from(title);
    }
    if let Some(ref text) = session.stopped_message {
        config.session.stopped_message.clone_from(text);
    }

    if let Some(ref path) = toml.storage.path {
        config.storage_path = Some(path.clone());
    }
    Ok(())
}

/// Apply `CHAT_*` environment overrides read through `env`
fn apply_env_config(
    config: &mut ChatConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(url) = env("CHAT_BACKEND_URL") {
        config.transport.url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(list) = env("CHAT_TRANSPORTS") {
        config.transport.transports =
            parse_transport_list(&list).map_err(ConfigError::ValidationError)?;
        config.source = ConfigSource::Env;
    }
    if let Some(attempts) = env("CHAT_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.transport.reconnect_attempts = attempts;
        config.source = ConfigSource::Env;
    }
    if let Some(delay) = env("CHAT_RECONNECT_DELAY").and_then(|v| v.parse().ok()) {
        config.transport.reconnect_delay_ms = delay;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("CHAT_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.transport.connect_timeout_ms = timeout;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("CHAT_TURN_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.session.turn_timeout_ms = timeout;
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("CHAT_STORAGE_PATH") {
        config.storage_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Overrides applied on top of file and environment values
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Backend base URL
    pub backend_url: Option<String>,
    /// Transport preference order
    pub transports: Option<Vec<TransportKind>>,
    /// Turn deadline in milliseconds
    pub turn_timeout_ms: Option<u64>,
    /// Local store file
    pub storage_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend URL
    #[must_use]
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    /// Set the transport order
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Set the turn deadline
    #[must_use]
    pub fn with_turn_timeout_ms(mut self, ms: u64) -> Self {
        self.turn_timeout_ms = Some(ms);
        self
    }

    /// Set the local store file
    #[must_use]
    pub fn with_storage_path(mut self, path: PathBuf) -> Self {
        self.storage_path = Some(path);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the overridden configuration fails validation.
    pub fn apply(&self, config: &mut ChatConfig) -> Result<(), ConfigError> {
        if self.backend_url.is_some()
            || self.transports.is_some()
            || self.turn_timeout_ms.is_some()
            || self.storage_path.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.backend_url {
            config.transport.url.clone_from(url);
        }
        if let Some(ref transports) = self.transports {
            config.transport.transports.clone_from(transports);
        }
        if let Some(ms) = self.turn_timeout_ms {
            config.session.turn_timeout_ms = ms;
        }
        if let Some(ref path) = self.storage_path {
            config.storage_path = Some(path.clone());
        }
        config.validate()
    }
}
