use serde::{Deserialize, Serialize};

use crate::order::Direction;

/// Public trade print from `trades.*` or a fill from `user.changes.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub instrument_name: String,
    pub price: f64,
    pub amount: f64,
    pub direction: Direction,
    pub timestamp: i64,
    #[serde(default)]
    pub trade_seq: Option<u64>,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Subset of the `ticker.*` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub instrument_name: String,
    pub timestamp: i64,
    #[serde(default)]
    pub best_bid_price: Option<f64>,
    #[serde(default)]
    pub best_ask_price: Option<f64>,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub mark_price: Option<f64>,
    #[serde(default)]
    pub index_price: Option<f64>,
}
