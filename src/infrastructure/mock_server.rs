//! Development feed server
//!
//! Speaks the feed protocol so the client can be exercised without the
//! real backend:
//! - `GET /health` answers 200 `{"status":"healthy"}`, or 503 when unhealthy
//! - `/ws/market-data` greets with `connection_established`, answers `ping`,
//!   `subscribe` and `unsubscribe`, rejects bad frames with `error`, and
//!   pushes `market_data_update` for subscribed symbols on an interval
//!
//! [`MockServer`] also lets tests flip health and cut live connections.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tracing::Level;

use crate::feed::synthetic::SyntheticFeed;
use crate::infrastructure::config::MockServerConfig;
use crate::log_api;
use crate::ws::protocol::iso_timestamp;

/// Instruction pushed to every live socket
#[derive(Debug, Clone, Copy)]
enum Kick {
    /// Drop the socket without a closing handshake
    Abort,
    /// Close with the given code
    Close(u16),
}

/// Shared server state
#[derive(Clone)]
struct ServerState {
    healthy: Arc<AtomicBool>,
    update_interval: Duration,
    next_connection: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<Value>>>,
    kick: broadcast::Sender<Kick>,
}

impl ServerState {
    fn new(config: &MockServerConfig) -> Self {
        let (kick, _) = broadcast::channel(16);
        Self {
            healthy: Arc::new(AtomicBool::new(config.healthy)),
            update_interval: Duration::from_millis(config.update_interval_ms.max(1)),
            next_connection: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicU64::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            kick,
        }
    }
}

/// Running server bound to a local address
pub struct MockServer {
    addr: SocketAddr,
    state: ServerState,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Bind and serve in the background. Port 0 picks an ephemeral port.
    pub async fn bind(config: &MockServerConfig) -> crate::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        let state = ServerState::new(config);
        let app = router(state.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log_api!(Level::ERROR, error = %e, "mock server stopped");
            }
        });

        log_api!(Level::INFO, %addr, "mock feed server listening");
        Ok(Self { addr, state, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket endpoint of this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/market-data", self.addr)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    /// Switch the `/health` answer
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Number of open WebSocket connections
    pub fn active_connections(&self) -> u64 {
        self.state.active.load(Ordering::Relaxed)
    }

    /// Connections accepted since start
    pub fn total_connections(&self) -> u64 {
        self.state.next_connection.load(Ordering::Relaxed)
    }

    /// Cut every live socket without a closing handshake
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(Kick::Abort);
    }

    /// Close every live socket with `code`
    pub fn close_connections(&self, code: u16) {
        let _ = self.state.kick.send(Kick::Close(code));
    }

    /// Every well-formed client frame received so far, in arrival order
    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    /// Received frames of one `type`
    pub async fn received_of_type(&self, kind: &str) -> Vec<Value> {
        self.received()
            .await
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    /// Stop accepting and cut live sockets
    pub fn shutdown(self) {
        self.drop_connections();
        self.task.abort();
    }
}

/// Serve until ctrl-c
pub async fn start_server(config: &MockServerConfig) -> crate::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    let state = ServerState::new(config);
    let app = router(state);

    log_api!(Level::INFO, addr = %config.bind, "mock feed server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    log_api!(Level::INFO, "mock feed server stopped");
    Ok(())
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/market-data", get(market_data_socket))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for /health
async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let connections = state.active.load(Ordering::Relaxed);
    if state.healthy.load(Ordering::Relaxed) {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "connections": connections,
                "timestamp": iso_timestamp(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "timestamp": iso_timestamp(),
            })),
        )
    }
}

/// Handler for /ws/market-data
async fn market_data_socket(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let id = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let connection_id = format!("conn_{}", id);
    state.active.fetch_add(1, Ordering::Relaxed);
    log_api!(Level::DEBUG, %connection_id, "client connected");

    let mut kicks = state.kick.subscribe();
    let mut quotes = SyntheticFeed::new(1..2);
    let mut subscribed = BTreeSet::new();
    let mut ticker = tokio::time::interval(state.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let welcome = json!({
        "type": "connection_established",
        "connection_id": connection_id,
        "timestamp": iso_timestamp(),
        "message": "Welcome to the market data feed",
    });

    if send_json(&mut socket, &welcome).await {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = respond(&state, &text, &mut subscribed).await;
                        if let Some(reply) = reply {
                            if !send_json(&mut socket, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                _ = ticker.tick() => {
                    let mut open = true;
                    for symbol in &subscribed {
                        let update = json!({
                            "type": "market_data_update",
                            "symbol": symbol,
                            "data": quotes.next_tick(symbol),
                            "timestamp": iso_timestamp(),
                        });
                        if !send_json(&mut socket, &update).await {
                            open = false;
                            break;
                        }
                    }
                    if !open {
                        break;
                    }
                },
                kick = kicks.recv() => match kick {
                    Ok(Kick::Abort) => break,
                    Ok(Kick::Close(code)) => {
                        let frame = CloseFrame { code, reason: Cow::Borrowed("") };
                        let _ = socket.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    state.active.fetch_sub(1, Ordering::Relaxed);
    log_api!(Level::DEBUG, %connection_id, "client disconnected");
}

/// Reply to one client text frame, `None` when nothing is owed
async fn respond(
    state: &ServerState,
    text: &str,
    subscribed: &mut BTreeSet<String>,
) -> Option<Value> {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return Some(json!({
            "type": "error",
            "message": "Invalid JSON format",
            "timestamp": iso_timestamp(),
        }));
    };
    state.received.lock().await.push(frame.clone());

    let symbol = frame["symbol"].as_str();
    match (frame["type"].as_str(), symbol) {
        (Some("subscribe"), Some(symbol)) => {
            subscribed.insert(symbol.to_owned());
            Some(json!({
                "type": "subscription_response",
                "symbol": symbol,
                "success": true,
                "timestamp": iso_timestamp(),
            }))
        }
        (Some("unsubscribe"), Some(symbol)) => {
            let success = subscribed.remove(symbol);
            Some(json!({
                "type": "unsubscription_response",
                "symbol": symbol,
                "success": success,
                "timestamp": iso_timestamp(),
            }))
        }
        // Missing symbol: ignored
        (Some("subscribe"), None) | (Some("unsubscribe"), None) => None,
        (Some("ping"), _) => Some(json!({
            "type": "pong",
            "timestamp": iso_timestamp(),
        })),
        (kind, _) => Some(json!({
            "type": "error",
            "message": format!("Unknown message type: {}", kind.unwrap_or("null")),
            "timestamp": iso_timestamp(),
        })),
    }
}

/// Send `value` as a text frame; false once the socket is gone
async fn send_json(socket: &mut WebSocket, value: &Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}
