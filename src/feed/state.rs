//! Observable connection state and event types

use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Externally visible connection state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Probing,
    Connecting,
    Connected,
    Disconnected,
    Error,
    SyntheticMode,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Probing => "probing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
            ConnectionState::SyntheticMode => "synthetic",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Server answered and reported itself healthy
    Reachable,
    /// Server answered and reported itself absent or unhealthy
    Negative,
    /// Network error, blocked request or timeout
    Ambiguous,
}

/// Failure taxonomy. None of these reach collaborators as errors; they are
/// folded into state transitions and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Probe could not decide; the handshake is attempted anyway
    ProbeAmbiguous,
    /// Probe says the server is absent; the handshake is skipped
    ProbeNegative,
    /// Transport did not open before the connect deadline
    HandshakeTimeout,
    /// Transport ended without a local teardown
    AbnormalClose,
    /// Inbound frame could not be parsed
    MalformedMessage,
}

/// Events broadcast to collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    LatencyUpdated {
        latency: Duration,
        synthetic: bool,
    },
    MarketData {
        symbol: String,
        data: Value,
        timestamp: Option<String>,
        synthetic: bool,
    },
    /// Advisory server acknowledgement of a subscribe
    SubscriptionAck { symbol: String, success: bool },
    /// Advisory server acknowledgement of an unsubscribe
    UnsubscriptionAck { symbol: String, success: bool },
    /// Diagnostic: a failure was folded into the state machine
    Failure(FailureKind),
}

/// Point-in-time view of the connection manager
#[derive(Debug, Clone, PartialEq)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub latency: Option<Duration>,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<String>,
}

impl FeedStatus {
    #[inline]
    pub fn is_synthetic_mode(&self) -> bool {
        self.state == ConnectionState::SyntheticMode
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            latency: None,
            reconnect_attempts: 0,
            subscriptions: Vec::new(),
        }
    }
}
