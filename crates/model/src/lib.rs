//! relay-model: trading state as received from Deribit
//!
//! Orders, positions and order book snapshots decode straight from the
//! exchange's JSON payloads. Order books are immutable once built and are
//! shared behind `Arc` so replacement is a pointer swap.

pub mod book;
pub mod error;
pub mod instrument;
pub mod order;
pub mod position;
pub mod trade;

pub use book::{OrderBookSnapshot, PriceLevel};
pub use error::ModelError;
pub use instrument::{instrument_currency, Instrument, InstrumentKind};
pub use order::{Direction, Order, OrderState, OrderType, TimeInForce};
pub use position::Position;
pub use trade::{Ticker, Trade};

pub type Result<T> = std::result::Result<T, ModelError>;

/// Decode a JSON value into a model type, tagging failures with `what`.
pub fn decode<T: serde::de::DeserializeOwned>(what: &'static str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| ModelError::Decode { what, source })
}
