//! WebSocket transport and wire protocol

pub mod connection;
pub mod ping;
pub mod protocol;
pub mod subscription;

pub use connection::{Frame, WebSocketConnection, WebSocketError, NORMAL_CLOSURE};
pub use ping::LatencySampler;
pub use protocol::{InboundMessage, MessageType, OutboundMessage};
pub use subscription::{SubscriptionSet, SubscriptionStatus};
