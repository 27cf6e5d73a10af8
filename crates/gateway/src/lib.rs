//! relay-gateway: upstream side of the relay
//!
//! - [`DeribitClient`]: JSON-RPC over HTTP with token handling
//! - [`DeribitStream`]: WebSocket session feeding the dispatcher
//! - [`InboundDispatcher`]: bounded queue + single worker thread
//! - [`UpstreamSubscriptions`]: channel handlers and subscribe requests
//! - [`DeribitApi`]: typed methods with a timeout on every call

pub mod api;
pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gateway;
pub mod pending;
pub mod protocol;
pub mod stream;
pub mod subscriptions;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use api::{DeribitApi, OrderPlacement, OrderRequest, DEFAULT_REQUEST_TIMEOUT};
pub use channel::{Channel, Interval};
pub use client::{
    Credentials, DeribitClient, MAINNET_REST_URL, MAINNET_WS_URL, TESTNET_REST_URL, TESTNET_WS_URL,
};
pub use dispatcher::{
    DispatcherStatsSnapshot, Handler, HandlerRegistry, InboundDispatcher, Ingest,
    DEFAULT_QUEUE_CAPACITY,
};
pub use error::GatewayError;
pub use event::StreamEvent;
pub use gateway::{ConnectionState, Gateway, StreamTransport};
pub use pending::{PendingReply, PendingRequests};
pub use stream::{DeribitStream, StreamConfig};
pub use subscriptions::UpstreamSubscriptions;
