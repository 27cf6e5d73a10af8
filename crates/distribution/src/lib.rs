//! relay-distribution: fan-out of relayed state to WebSocket clients
//!
//! Clients subscribe to named channels (`orderbook.<instrument>`,
//! `orders.<instrument>`, `positions.<instrument>`). The server keeps a
//! channel <-> connection index and broadcasts pre-encoded JSON to the
//! current subscribers of a channel.

pub mod connection;
pub mod error;
pub mod index;
pub mod protocol;
pub mod server;

pub use connection::{ConnState, ConnectionId, ConnectionTable, SendFailure, OUTBOUND_CAPACITY};
pub use error::{DistributionError, ProtocolError};
pub use index::SubscriptionIndex;
pub use protocol::{ClientRequest, ServerMessage, WELCOME_MESSAGE};
pub use server::{DistributionServer, DistributionStats, DistributionStatsSnapshot};

pub type Result<T> = std::result::Result<T, DistributionError>;
