//! Market data feed client
//!
//! # Commands
//! - **connect**: run the connection manager and print feed events
//! - **serve**: run the development feed server
//! - **probe**: query the health endpoint once

use anyhow::Context;
use clap::{Parser, Subcommand};
use feed_link::feed::{FeedEvent, FeedManager, HttpHealthProbe};
use feed_link::infrastructure::logging::init_logging;
use feed_link::infrastructure::mock_server::start_server;
use feed_link::{log_main, Config};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;

/// Resilient market data feed client
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect to the feed and print events until ctrl-c
    Connect {
        /// Symbols to subscribe to
        symbols: Vec<String>,
        /// Override the WebSocket endpoint
        #[arg(long)]
        url: Option<String>,
        /// Skip the health probe
        #[arg(long)]
        no_probe: bool,
    },
    /// Serve the development feed until ctrl-c
    Serve {
        /// Override the bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Answer /health with 503
        #[arg(long)]
        unhealthy: bool,
    },
    /// Query the health endpoint once
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("loading configuration")?;
    let _guards = init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Commands::Connect {
            symbols,
            url,
            no_probe,
        } => {
            if let Some(url) = url {
                config.feed.ws_url = url;
            }
            if no_probe {
                config.feed.health_url = None;
            }
            config.validate()?;
            run_client(&config, symbols).await
        }
        Commands::Serve { bind, unhealthy } => {
            if let Some(bind) = bind {
                config.mock_server.bind = bind;
            }
            if unhealthy {
                config.mock_server.healthy = false;
            }
            start_server(&config.mock_server).await?;
            Ok(())
        }
        Commands::Probe => {
            let probe = HttpHealthProbe::new(config.feed.health_url().map(str::to_owned));
            let timeout = Duration::from_millis(config.feed.probe_timeout_ms);
            let (status, body) = probe.check(timeout).await?;
            let outcome = HttpHealthProbe::classify(status, &body);
            println!(
                "{} -> {} ({:?})",
                config.feed.health_url().unwrap_or_default(),
                status,
                outcome
            );
            Ok(())
        }
    }
}

async fn run_client(config: &Config, symbols: Vec<String>) -> anyhow::Result<()> {
    log_main!(Level::INFO, url = %config.feed.ws_url, "starting feed client");

    let manager = FeedManager::new(&config.feed);
    let mut events = manager.events();

    for symbol in symbols {
        manager.subscribe(symbol);
    }
    manager.connect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log_main!(Level::WARN, skipped, "event consumer lagging");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let snapshot = manager.metrics().snapshot();
    log_main!(
        Level::INFO,
        messages = snapshot.messages,
        malformed = snapshot.malformed,
        reconnects = snapshot.reconnects,
        synthetic_activations = snapshot.synthetic_activations,
        "shutting down"
    );
    manager.shutdown().await;
    Ok(())
}

fn print_event(event: &FeedEvent) {
    match event {
        FeedEvent::StateChanged { from, to } => println!("state    {} -> {}", from, to),
        FeedEvent::LatencyUpdated { latency, synthetic } => {
            let tag = if *synthetic { " (synthetic)" } else { "" };
            println!("latency  {}ms{}", latency.as_millis(), tag);
        }
        FeedEvent::MarketData {
            symbol,
            data,
            synthetic,
            ..
        } => {
            let tag = if *synthetic { " (synthetic)" } else { "" };
            println!("quote    {} {}{}", symbol, data, tag);
        }
        FeedEvent::SubscriptionAck { symbol, success } => {
            println!("sub-ack  {} success={}", symbol, success)
        }
        FeedEvent::UnsubscriptionAck { symbol, success } => {
            println!("unsub    {} success={}", symbol, success)
        }
        FeedEvent::Failure(kind) => println!("failure  {:?}", kind),
    }
}
