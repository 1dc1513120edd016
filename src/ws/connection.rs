//! WebSocket transport for the feed
//!
//! Thin layer over tokio-tungstenite. After the handshake the stream is
//! split so a writer task drains the outbound queue while a reader task
//! drains inbound frames.
//! - TCP_NODELAY on plain connections
//! - Close frames carry an explicit code (1000 for local teardown)
//! - Protocol-level ping/pong frames are answered by tungstenite itself

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Close code for an intentional local teardown
pub const NORMAL_CLOSURE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors that can occur with WebSocket connections
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Freshly opened connection, not yet split
pub struct WebSocketConnection {
    stream: WsStream,
    url: String,
}

/// One inbound event from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload
    Text(String),
    /// Stream ended. `Some(code)` if the peer sent a close frame with a code.
    Closed(Option<u16>),
}

impl WebSocketConnection {
    /// Perform the WebSocket handshake against `url` (ws:// or wss://).
    ///
    /// No timeout is applied here; the connection manager owns the
    /// connect deadline and abandons the attempt when it expires.
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;

        if let MaybeTlsStream::Plain(tcp) = stream.get_ref() {
            // Disable Nagle's algorithm - small JSON frames go out immediately
            tcp.set_nodelay(true)
                .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;
        }

        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }

    /// Get connection URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Split into independently owned halves
    pub fn split(self) -> (TransportWriter, TransportReader) {
        let (sink, stream) = self.stream.split();
        (
            TransportWriter { sink, open: true },
            TransportReader { stream },
        )
    }
}

/// Sending half, exclusively owned by one writer task
pub struct TransportWriter {
    sink: SplitSink<WsStream, Message>,
    open: bool,
}

impl TransportWriter {
    /// Send a text frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        if !self.open {
            return Err(WebSocketError::NotConnected);
        }
        self.sink
            .send(Message::text(text.to_owned()))
            .await
            .map_err(|e| WebSocketError::SendFailed(e.to_string()))
    }

    /// Send a close frame with `code` and shut the sink down.
    ///
    /// Errors are swallowed: the peer may already be gone.
    pub async fn close(&mut self, code: u16) {
        if !self.open {
            return;
        }
        self.open = false;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Receiving half, drained by a reader task
pub struct TransportReader {
    stream: SplitStream<WsStream>,
}

impl TransportReader {
    /// Wait for the next text frame or the end of the stream.
    ///
    /// Binary and control frames are skipped. Read errors end the stream
    /// without a close code.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Frame::Text(text.as_str().to_owned()),
                Some(Ok(Message::Close(frame))) => {
                    return Frame::Closed(frame.map(|f| u16::from(f.code)))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(target: "ws", error = %e, "transport read failed");
                    return Frame::Closed(None);
                }
                None => return Frame::Closed(None),
            }
        }
    }
}
