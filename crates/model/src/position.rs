use serde::{Deserialize, Serialize};

/// Current position in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_name: String,
    /// Signed; negative for short.
    pub size: f64,
    /// Entry price.
    pub average_price: f64,
    pub mark_price: f64,
    #[serde(default)]
    pub estimated_liquidation_price: Option<f64>,
    /// Unrealized PnL.
    pub floating_profit_loss: f64,
    #[serde(default)]
    pub realized_profit_loss: f64,
    #[serde(default)]
    pub total_profit_loss: f64,
    #[serde(default)]
    pub kind: Option<String>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size == 0.0
    }
}
