use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use relay_model::{decode, ModelError, Order, OrderBookSnapshot, Position, Ticker, Trade};

use crate::channel::Channel;

/// A decoded push notification. The variant is fixed by the channel kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    OrderBook(Arc<OrderBookSnapshot>),
    Trades(Vec<Trade>),
    Ticker(Ticker),
    Orders(Vec<Order>),
    Changes {
        instrument: Option<String>,
        orders: Vec<Order>,
        positions: Vec<Position>,
        trades: Vec<Trade>,
    },
}

#[derive(Deserialize)]
struct ChangesPayload {
    #[serde(default)]
    instrument_name: Option<String>,
    #[serde(default)]
    orders: Vec<Order>,
    #[serde(default)]
    positions: Vec<Position>,
    #[serde(default)]
    trades: Vec<Trade>,
}

impl StreamEvent {
    pub fn decode(channel: &Channel, data: Value) -> Result<Self, ModelError> {
        match channel {
            Channel::Book { .. } => Ok(StreamEvent::OrderBook(Arc::new(decode("order book", data)?))),
            Channel::Trades { .. } => Ok(StreamEvent::Trades(decode("trades", data)?)),
            Channel::Ticker { .. } => Ok(StreamEvent::Ticker(decode("ticker", data)?)),
            // raw interval pushes one order, aggregated intervals push a list
            Channel::UserOrders { .. } => match data {
                Value::Array(_) => Ok(StreamEvent::Orders(decode("orders", data)?)),
                single => Ok(StreamEvent::Orders(vec![decode("order", single)?])),
            },
            Channel::UserChanges { .. } => {
                let changes: ChangesPayload = decode("changes", data)?;
                Ok(StreamEvent::Changes {
                    instrument: changes.instrument_name,
                    orders: changes.orders,
                    positions: changes.positions,
                    trades: changes.trades,
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::OrderBook(_) => "orderbook",
            StreamEvent::Trades(_) => "trades",
            StreamEvent::Ticker(_) => "ticker",
            StreamEvent::Orders(_) => "orders",
            StreamEvent::Changes { .. } => "changes",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interval;
    use serde_json::json;

    fn order(id: &str, state: &str) -> Value {
        json!({
            "order_id": id,
            "instrument_name": "BTC-PERPETUAL",
            "order_type": "limit",
            "direction": "buy",
            "price": 50000.0,
            "amount": 10.0,
            "time_in_force": "good_til_cancelled",
            "order_state": state,
            "creation_timestamp": 1,
            "last_update_timestamp": 2
        })
    }

    #[test]
    fn test_decode_book() {
        let ch = Channel::book("BTC-PERPETUAL", 10, Interval::Ms100);
        let data = json!({
            "timestamp": 1554375447971i64,
            "instrument_name": "BTC-PERPETUAL",
            "change_id": 297217,
            "bids": [[5042.34, 30]],
            "asks": [[5046.7, 10]]
        });
        match StreamEvent::decode(&ch, data).unwrap() {
            StreamEvent::OrderBook(book) => {
                assert_eq!(book.bids[0].price, 5042.34);
                assert_eq!(book.asks[0].size, 10.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_single_and_batched_orders() {
        let ch = Channel::user_orders();
        let single = StreamEvent::decode(&ch, order("1", "open")).unwrap();
        assert!(matches!(single, StreamEvent::Orders(ref v) if v.len() == 1));

        let batched = StreamEvent::decode(&ch, json!([order("1", "open"), order("2", "filled")])).unwrap();
        assert!(matches!(batched, StreamEvent::Orders(ref v) if v.len() == 2));
    }

    #[test]
    fn test_decode_changes() {
        let ch = Channel::user_changes();
        let data = json!({
            "instrument_name": "BTC-PERPETUAL",
            "trades": [],
            "orders": [order("7", "cancelled")],
            "positions": [{
                "instrument_name": "BTC-PERPETUAL",
                "size": 10,
                "average_price": 50000,
                "mark_price": 50010,
                "floating_profit_loss": 0.1,
                "realized_profit_loss": 0
            }]
        });
        match StreamEvent::decode(&ch, data).unwrap() {
            StreamEvent::Changes { instrument, orders, positions, trades } => {
                assert_eq!(instrument.as_deref(), Some("BTC-PERPETUAL"));
                assert_eq!(orders.len(), 1);
                assert_eq!(positions[0].size, 10.0);
                assert!(trades.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_mismatch_is_error() {
        let ch = Channel::book("BTC-PERPETUAL", 10, Interval::Ms100);
        let err = StreamEvent::decode(&ch, json!({"foo": 1})).unwrap_err();
        assert!(err.to_string().contains("order book"));
    }
}
