use thiserror::Error;

use crate::connection::{ConnState, ConnectionId};

/// Errors from the distribution server
#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnState,
        to: ConnState,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A client message the server could not act on. Sent back as an `error`
/// reply; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Malformed(String),

    #[error("{0} message missing 'channel' field")]
    MissingChannel(&'static str),

    #[error("channel must not be empty")]
    EmptyChannel,

    #[error("binary frames are not supported")]
    Binary,
}
