use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::connection::ConnectionId;

#[derive(Default)]
struct Inner {
    by_channel: HashMap<String, HashSet<ConnectionId>>,
    by_conn: HashMap<ConnectionId, HashSet<String>>,
}

/// Channel <-> connection index.
///
/// Both directions live under one lock so they always agree: a connection
/// appears in a channel's set exactly when the channel appears in that
/// connection's set. Empty sets are removed.
#[derive(Default)]
pub struct SubscriptionIndex {
    inner: Mutex<Inner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the connection was already subscribed.
    pub fn subscribe(&self, conn: ConnectionId, channel: &str) -> bool {
        let mut inner = self.lock();
        let added = inner
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(conn);
        inner.by_conn.entry(conn).or_default().insert(channel.to_string());
        added
    }

    /// Returns false if the connection was not subscribed.
    pub fn unsubscribe(&self, conn: ConnectionId, channel: &str) -> bool {
        let mut inner = self.lock();
        let removed = match inner.by_channel.get_mut(channel) {
            Some(set) => {
                let removed = set.remove(&conn);
                if set.is_empty() {
                    inner.by_channel.remove(channel);
                }
                removed
            }
            None => false,
        };
        if let Some(set) = inner.by_conn.get_mut(&conn) {
            set.remove(channel);
            if set.is_empty() {
                inner.by_conn.remove(&conn);
            }
        }
        removed
    }

    /// Drop every subscription the connection holds. Returns the channels it
    /// was removed from.
    pub fn remove_connection(&self, conn: ConnectionId) -> Vec<String> {
        let mut inner = self.lock();
        let Some(channels) = inner.by_conn.remove(&conn) else {
            return Vec::new();
        };
        for channel in &channels {
            if let Some(set) = inner.by_channel.get_mut(channel) {
                set.remove(&conn);
                if set.is_empty() {
                    inner.by_channel.remove(channel);
                }
            }
        }
        let mut channels: Vec<String> = channels.into_iter().collect();
        channels.sort();
        channels
    }

    /// Copy of the channel's subscribers; the lock is released on return.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.lock()
            .by_channel
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().by_channel.get(channel).map_or(0, HashSet::len)
    }

    pub fn channels_of(&self, conn: ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .lock()
            .by_conn
            .get(&conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    #[cfg(test)]
    fn is_subscribed(&self, conn: ConnectionId, channel: &str) -> bool {
        self.lock()
            .by_conn
            .get(&conn)
            .is_some_and(|set| set.contains(channel))
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.lock().by_channel.len()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.lock();
        let forward = inner
            .by_channel
            .iter()
            .all(|(ch, conns)| !conns.is_empty() && conns.iter().all(|c| inner.by_conn.get(c).is_some_and(|s| s.contains(ch))));
        let backward = inner
            .by_conn
            .iter()
            .all(|(c, chans)| !chans.is_empty() && chans.iter().all(|ch| inner.by_channel.get(ch).is_some_and(|s| s.contains(c))));
        forward && backward
    }
}
