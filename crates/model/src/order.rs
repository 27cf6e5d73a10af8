use serde::{Deserialize, Deserializer, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Private RPC method that places an order on this side.
    pub fn method(&self) -> &'static str {
        match self {
            Direction::Buy => "private/buy",
            Direction::Sell => "private/sell",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "buy"),
            Direction::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    StopLimit,
    StopMarket,
    TakeLimit,
    TakeMarket,
    MarketLimit,
    TrailingStop,
}

impl OrderType {
    /// Whether the order needs an explicit limit price.
    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            OrderType::Limit | OrderType::StopLimit | OrderType::TakeLimit
        )
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::StopLimit => "stop_limit",
            OrderType::StopMarket => "stop_market",
            OrderType::TakeLimit => "take_limit",
            OrderType::TakeMarket => "take_market",
            OrderType::MarketLimit => "market_limit",
            OrderType::TrailingStop => "trailing_stop",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    #[default]
    GoodTilCancelled,
    GoodTilDay,
    FillOrKill,
    ImmediateOrCancel,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeInForce::GoodTilCancelled => "good_til_cancelled",
            TimeInForce::GoodTilDay => "good_til_day",
            TimeInForce::FillOrKill => "fill_or_kill",
            TimeInForce::ImmediateOrCancel => "immediate_or_cancel",
        };
        write!(f, "{}", s)
    }
}

/// Exchange-reported order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Resting on the book
    Open,
    /// Stop/take order waiting for its trigger
    Untriggered,
    /// Completely filled (terminal)
    Filled,
    /// Cancelled by user or exchange (terminal)
    Cancelled,
    /// Rejected by the exchange (terminal)
    Rejected,
    /// Any state this build does not know about; treated as live
    #[serde(other)]
    Unknown,
}

impl OrderState {
    /// Whether this is a terminal state (no further transitions occur)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Open => "open",
            OrderState::Untriggered => "untriggered",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// An order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub instrument_name: String,
    pub order_type: OrderType,
    pub direction: Direction,
    /// `None` for market orders, which Deribit reports as `"market_price"`.
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price: Option<f64>,
    pub amount: f64,
    #[serde(default)]
    pub filled_amount: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    pub order_state: OrderState,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    pub creation_timestamp: i64,
    pub last_update_timestamp: i64,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        self.order_state.is_terminal()
    }
}

fn deserialize_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPrice {
        Number(f64),
        Text(String),
    }

    match Option::<RawPrice>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPrice::Number(p)) => Ok(Some(p)),
        Some(RawPrice::Text(s)) if s == "market_price" => Ok(None),
        Some(RawPrice::Text(s)) => s
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid price: {}", s))),
    }
}
