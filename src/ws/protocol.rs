//! Feed wire protocol
//!
//! JSON text frames with a `type` discriminator. Outbound frames are built
//! by the client; inbound frames are parsed leniently: unknown types decode
//! to [`InboundMessage::Unknown`] and unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Message type discriminator shared by both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    MarketDataUpdate,
    SubscriptionResponse,
    UnsubscriptionResponse,
}

/// Client -> server frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
}

impl OutboundMessage {
    fn new(kind: MessageType, symbol: Option<&str>) -> Self {
        Self {
            kind,
            symbol: symbol.map(str::to_owned),
            data: None,
            timestamp: iso_timestamp(),
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, None)
    }

    pub fn subscribe(symbol: &str) -> Self {
        Self::new(MessageType::Subscribe, Some(symbol))
    }

    pub fn unsubscribe(symbol: &str) -> Self {
        Self::new(MessageType::Unsubscribe, Some(symbol))
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> String {
        // Plain struct of strings and Values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server -> client frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },
    MarketDataUpdate {
        symbol: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    SubscriptionResponse {
        symbol: String,
        #[serde(default)]
        success: Option<bool>,
    },
    UnsubscriptionResponse {
        symbol: String,
        #[serde(default)]
        success: Option<bool>,
    },
    /// Any type this client does not act on
    #[serde(other)]
    Unknown,
}

/// Parse an inbound text frame
#[inline]
pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Current UTC time as an RFC 3339 / ISO-8601 string
pub fn iso_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
