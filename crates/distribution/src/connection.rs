use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::DistributionError;

/// Outbound frames buffered per connection before sends start failing.
pub const OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnState {
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Open => write!(f, "open"),
            ConnState::Closing => write!(f, "closing"),
            ConnState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a send to one connection did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Unknown,
    NotOpen(ConnState),
    Full,
    Closed,
}

struct Entry {
    state: ConnState,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<WsMessage>,
}

/// Live connections keyed by id.
pub struct ConnectionTable {
    next_id: AtomicU64,
    entries: DashMap<ConnectionId, Entry>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Register a new connection in `Connecting`. The receiver feeds the
    /// connection's writer.
    pub fn register(&self, peer: Option<SocketAddr>) -> (ConnectionId, mpsc::Receiver<WsMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.entries.insert(
            id,
            Entry {
                state: ConnState::Connecting,
                peer,
                tx,
            },
        );
        (id, rx)
    }

    pub fn transition(&self, id: ConnectionId, to: ConnState) -> Result<(), DistributionError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(DistributionError::UnknownConnection(id))?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(DistributionError::InvalidTransition { id, from, to });
        }
        entry.state = to;
        Ok(())
    }

    /// Drop the entry after moving it to `Closed`. Dropping the sender ends
    /// the writer once it drains.
    pub fn remove(&self, id: ConnectionId) -> Result<(), DistributionError> {
        self.transition(id, ConnState::Closed)?;
        self.entries.remove(&id);
        Ok(())
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnState> {
        self.entries.get(&id).map(|e| e.state)
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.entries.get(&id).and_then(|e| e.peer)
    }

    /// Non-blocking send to an `Open` connection.
    pub fn try_send(&self, id: ConnectionId, msg: WsMessage) -> Result<(), SendFailure> {
        // clone the sender so no shard lock is held while sending
        let tx = {
            let entry = self.entries.get(&id).ok_or(SendFailure::Unknown)?;
            if entry.state != ConnState::Open {
                return Err(SendFailure::NotOpen(entry.state));
            }
            entry.tx.clone()
        };
        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Ids of connections currently `Open`.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|e| e.state == ConnState::Open)
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Connections in the table, in any state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
