//! Configuration management for the feed client
//!
//! Loads configuration from config.toml at startup.
//! All timing and retry values are tunable here instead of being
//! hardcoded in the state machine.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Feed client configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Connection manager settings
    #[serde(default)]
    pub feed: FeedConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Development feed server settings
    #[serde(default)]
    pub mock_server: MockServerConfig,
}

/// Connection lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// WebSocket endpoint of the live-data server
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Liveness endpoint probed before the handshake (None disables probing)
    #[serde(default = "default_health_url")]
    pub health_url: Option<String>,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnects tried after a live connection drops
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_synthetic_interval_ms")]
    pub synthetic_interval_ms: u64,

    /// Synthetic latency is drawn from [min, max)
    #[serde(default = "default_synthetic_latency_min_ms")]
    pub synthetic_latency_min_ms: u64,

    #[serde(default = "default_synthetic_latency_max_ms")]
    pub synthetic_latency_max_ms: u64,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Log output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Development feed server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Interval between pushed market data updates
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// When false, /health answers 503
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            health_url: default_health_url(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            synthetic_interval_ms: default_synthetic_interval_ms(),
            synthetic_latency_min_ms: default_synthetic_latency_min_ms(),
            synthetic_latency_max_ms: default_synthetic_latency_max_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
        }
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            update_interval_ms: default_update_interval_ms(),
            healthy: default_healthy(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8001/ws/market-data".to_string()
}

fn default_health_url() -> Option<String> {
    Some("http://127.0.0.1:8001/health".to_string())
}

fn default_probe_timeout_ms() -> u64 {
    300
}

fn default_connect_timeout_ms() -> u64 {
    1_200
}

fn default_max_reconnect_attempts() -> u32 {
    2
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    3_000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_synthetic_interval_ms() -> u64 {
    3_000
}

fn default_synthetic_latency_min_ms() -> u64 {
    10
}

fn default_synthetic_latency_max_ms() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    1_024
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8001))
}

fn default_update_interval_ms() -> u64 {
    1_000
}

fn default_healthy() -> bool {
    true
}

impl FeedConfig {
    /// Health endpoint, `None` when probing is disabled (absent or empty)
    pub fn health_url(&self) -> Option<&str> {
        self.health_url.as_deref().filter(|url| !url.is_empty())
    }
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed or fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        let config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Config::default()
            }
            Err(e) => return Err(ConfigError::IoError(e)),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject values the connection manager cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let feed = &self.feed;

        let ws = url::Url::parse(&feed.ws_url)
            .map_err(|e| ConfigError::Invalid(format!("ws_url: {}", e)))?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(ConfigError::Invalid(format!(
                "ws_url must use ws:// or wss://, got {}://",
                ws.scheme()
            )));
        }

        if let Some(health) = feed.health_url() {
            let health = url::Url::parse(health)
                .map_err(|e| ConfigError::Invalid(format!("health_url: {}", e)))?;
            if health.scheme() != "http" && health.scheme() != "https" {
                return Err(ConfigError::Invalid(
                    "health_url must use http:// or https://".to_string(),
                ));
            }
        }

        if feed.probe_timeout_ms == 0 || feed.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if feed.reconnect_base_delay_ms > feed.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect_base_delay_ms exceeds reconnect_max_delay_ms".to_string(),
            ));
        }
        if feed.ping_interval_secs == 0 || feed.synthetic_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        if feed.synthetic_latency_min_ms >= feed.synthetic_latency_max_ms {
            return Err(ConfigError::Invalid(
                "synthetic latency range is empty".to_string(),
            ));
        }
        if feed.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
    /// Parsed but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) | ConfigError::Invalid(_) => None,
        }
    }
}
