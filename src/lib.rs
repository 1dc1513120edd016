//! Resilient live market-data feed client
//!
//! Keeps a WebSocket connection to a market-data server alive: probes the
//! server before connecting, reconnects with bounded backoff, replays
//! subscriptions, measures latency with ping/pong, and falls back to a
//! synthetic feed when the server cannot be reached.

pub mod feed;
pub mod infrastructure;
pub mod ws;

// Re-export commonly used types
pub use feed::{ConnectionState, FeedEvent, FeedManager, FeedStatus};
pub use infrastructure::config::{Config, FeedConfig, LoggingConfig, MockServerConfig};

use thiserror::Error;

/// Main error type for the feed client
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] ws::WebSocketError),

    #[error("Health probe error: {0}")]
    Probe(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] infrastructure::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FeedError>;
