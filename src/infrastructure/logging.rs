//! Centralized file-based logging
//!
//! Writes logs to files under the configured directory, separated by type:
//! - main/  - everything, JSON lines
//! - error/ - warnings and errors only
//! - feed/  - connection manager and transport logs
//! - api/   - development server logs

use crate::infrastructure::config::LoggingConfig;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log file categories, one subdirectory each
pub const LOG_TYPES: [&str; 4] = ["main", "error", "feed", "api"];

/// Initialize console and rolling-file logging
///
/// Returns the appender guards, which must be kept alive for the duration
/// of the program. `RUST_LOG` overrides the configured filter.
pub fn init_logging(config: &LoggingConfig) -> std::io::Result<Vec<WorkerGuard>> {
    create_log_dirs(&config.dir)?;

    let mut guards = Vec::new();

    let (main_appender, main_guard) = create_appender(&config.dir, "main");
    guards.push(main_guard);

    let (error_appender, error_guard) = create_appender(&config.dir, "error");
    guards.push(error_guard);

    let (feed_appender, feed_guard) = create_appender(&config.dir, "feed");
    guards.push(feed_guard);

    let (api_appender, api_guard) = create_appender(&config.dir, "api");
    guards.push(api_guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let feed_layer = tracing_subscriber::fmt::layer()
        .with_writer(feed_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            is_feed_target(metadata.target())
        }));

    let api_layer = tracing_subscriber::fmt::layer()
        .with_writer(api_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().contains("api") || metadata.target().contains("server")
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(feed_layer)
        .with(api_layer)
        .with(console_layer)
        .init();

    tracing::info!(dir = %config.dir.display(), "Logging system initialized");

    Ok(guards)
}

/// Create the log directory and one subdirectory per log type
pub fn create_log_dirs(root: &Path) -> std::io::Result<()> {
    for log_type in LOG_TYPES {
        fs::create_dir_all(root.join(log_type))?;
    }
    Ok(())
}

/// Targets routed to the feed log
pub fn is_feed_target(target: &str) -> bool {
    target.contains("feed") || target.contains("ws") || target.contains("connection")
}

/// Create a daily rolling, non-blocking file appender
fn create_appender(root: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, root.join(name), name);
    tracing_appender::non_blocking(appender)
}

/// Log macro helpers for specific log types
#[macro_export]
macro_rules! log_feed {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "feed", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_api {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "api", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_main {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "main", $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_creation() {
        let test_dir = std::env::temp_dir().join(format!("feed_link_logs_{}", std::process::id()));
        if test_dir.exists() {
            fs::remove_dir_all(&test_dir).ok();
        }

        create_log_dirs(&test_dir).unwrap();
        for log_type in LOG_TYPES {
            assert!(test_dir.join(log_type).is_dir());
        }

        // Idempotent
        create_log_dirs(&test_dir).unwrap();

        fs::remove_dir_all(&test_dir).ok();
    }

    #[test]
    fn test_feed_target_routing() {
        assert!(is_feed_target("feed"));
        assert!(is_feed_target("feed_link::ws::connection"));
        assert!(!is_feed_target("api"));
        assert!(!is_feed_target("main"));
    }
}
