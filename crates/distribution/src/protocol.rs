//! Client-facing JSON messages.
//!
//! Clients send `{"type":"subscribe"|"unsubscribe","channel":"..."}`; every
//! server message carries a `type` tag.

use serde::{Deserialize, Serialize};

use relay_model::{Order, OrderBookSnapshot, Position};

use crate::error::ProtocolError;

pub const WELCOME_MESSAGE: &str = "Welcome to Deribit Relay WebSocket Server";

/// Channel prefix that triggers an order book snapshot on subscribe.
pub const ORDERBOOK_PREFIX: &str = "orderbook.";

pub fn orderbook_channel(instrument: &str) -> String {
    format!("{}{}", ORDERBOOK_PREFIX, instrument)
}

pub fn orders_channel(instrument: &str) -> String {
    format!("orders.{}", instrument)
}

pub fn positions_channel(instrument: &str) -> String {
    format!("positions.{}", instrument)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

/// Wire shape of a client message. `channel` is optional here so a missing
/// one gets its own error instead of serde's generic message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channel: Option<String> },
    Unsubscribe { channel: Option<String> },
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: ClientMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let (kind, channel) = match msg {
            ClientMessage::Subscribe { channel } => ("subscribe", channel),
            ClientMessage::Unsubscribe { channel } => ("unsubscribe", channel),
        };
        let channel = channel.ok_or(ProtocolError::MissingChannel(kind))?;
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(ProtocolError::EmptyChannel);
        }
        let channel = channel.to_string();

        Ok(match kind {
            "subscribe" => ClientRequest::Subscribe { channel },
            _ => ClientRequest::Unsubscribe { channel },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
    },
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Error {
        message: String,
    },
    Orderbook {
        instrument_name: String,
        timestamp: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
    },
    Order(Order),
    Position(Position),
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: WELCOME_MESSAGE.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn orderbook(book: &OrderBookSnapshot) -> Self {
        let levels = |side: &[relay_model::PriceLevel]| side.iter().map(|l| (l.price, l.size)).collect();
        ServerMessage::Orderbook {
            instrument_name: book.instrument_name.clone(),
            timestamp: book.timestamp.to_string(),
            bids: levels(&book.bids),
            asks: levels(&book.asks),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_model::PriceLevel;
    use serde_json::{json, Value};

    #[test]
    fn test_parse_subscribe() {
        let req = ClientRequest::parse(r#"{"type":"subscribe","channel":"orderbook.BTC-PERPETUAL"}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::Subscribe {
                channel: "orderbook.BTC-PERPETUAL".into()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let malformed = |text: &str| match ClientRequest::parse(text) {
            Err(ProtocolError::Malformed(msg)) => msg,
            other => panic!("expected malformed for {}, got {:?}", text, other),
        };
        malformed("{not json");
        malformed("[1,2]");
        assert!(malformed(r#"{"channel":"x"}"#).contains("type"));
        assert!(malformed(r#"{"type":"publish","channel":"x"}"#).contains("publish"));
        malformed(r#"{"type":"subscribe","channel":7}"#);

        assert_eq!(
            ClientRequest::parse(r#"{"type":"unsubscribe"}"#),
            Err(ProtocolError::MissingChannel("unsubscribe"))
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"subscribe","channel":"  "}"#),
            Err(ProtocolError::EmptyChannel)
        );
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        let req = ClientRequest::parse(r#"{"channel":"orders.ETH-PERPETUAL","id":3,"type":"unsubscribe"}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::Unsubscribe {
                channel: "orders.ETH-PERPETUAL".into()
            }
        );
    }

    #[test]
    fn test_orderbook_wire_format() {
        let book = OrderBookSnapshot {
            instrument_name: "BTC-PERPETUAL".into(),
            bids: vec![PriceLevel { price: 100.0, size: 1.5 }],
            asks: vec![],
            timestamp: 1_700_000_000_123,
            change_id: None,
        };
        let v: Value = serde_json::from_str(&ServerMessage::orderbook(&book).to_json().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "orderbook",
                "instrument_name": "BTC-PERPETUAL",
                "timestamp": "1700000000123",
                "bids": [[100.0, 1.5]],
                "asks": []
            })
        );
    }

    #[test]
    fn test_simple_messages() {
        let v: Value = serde_json::from_str(&ServerMessage::welcome().to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "welcome", "message": WELCOME_MESSAGE}));

        let v: Value = serde_json::from_str(
            &ServerMessage::Unsubscribed { channel: "c".into() }.to_json().unwrap(),
        )
        .unwrap();
        assert_eq!(v, json!({"type": "unsubscribed", "channel": "c"}));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(orderbook_channel("ETH-PERPETUAL"), "orderbook.ETH-PERPETUAL");
        assert_eq!(orders_channel("ETH-PERPETUAL"), "orders.ETH-PERPETUAL");
        assert_eq!(positions_channel("ETH-PERPETUAL"), "positions.ETH-PERPETUAL");
    }
}
