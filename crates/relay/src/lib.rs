//! deribit-relay: Deribit market and account state relayed to WebSocket clients
//!
//! The [`Orchestrator`] wires the upstream gateway, the inbound dispatcher,
//! the state cache and the distribution server together. The binary adds
//! configuration, logging, a health/metrics server and signal handling.

pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod server;
pub mod shutdown;

pub use config::{Config, LogFormat};
pub use error::RelayError;
pub use metrics::{Metrics, RelayStats, StatsSource};
pub use orchestrator::Orchestrator;
