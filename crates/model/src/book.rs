use serde::{Deserialize, Serialize};

/// One price level. On the wire this is a `[price, size]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

impl From<(f64, f64)> for PriceLevel {
    fn from((price, size): (f64, f64)) -> Self {
        Self { price, size }
    }
}

impl From<PriceLevel> for (f64, f64) {
    fn from(level: PriceLevel) -> Self {
        (level.price, level.size)
    }
}

/// Full order book for one instrument at one point in time.
///
/// Built once and never mutated; an update produces a new snapshot which
/// replaces the old one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument_name: String,
    /// Best bid first.
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    /// Best ask first.
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    /// Exchange timestamp, ms since epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub change_id: Option<u64>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}
