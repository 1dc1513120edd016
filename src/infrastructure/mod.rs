//! Infrastructure - everything around the connection manager
//!
//! This module contains:
//! - Configuration management
//! - Logging and metrics
//! - Development feed server

pub mod config;
pub mod logging;
pub mod metrics;
pub mod mock_server;

pub use metrics::{FeedMetrics, MetricsSnapshot};
