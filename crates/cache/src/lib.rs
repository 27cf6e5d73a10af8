//! relay-cache: last-known trading state
//!
//! Orders, positions and order books each live in their own map behind their
//! own lock. Reads are cache-aside; pushes replace whole records.

pub mod cache;
pub mod error;
mod table;

pub use cache::{CacheStats, OrderUpdate, StateCache};
pub use error::CacheError;

pub type Result<T> = std::result::Result<T, CacheError>;
