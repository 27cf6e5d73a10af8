//! Correlation of JSON-RPC responses with the requests that caused them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::GatewayError;
use crate::protocol::RpcError;

type Reply = Result<Value, GatewayError>;

struct Waiter {
    method: String,
    tx: oneshot::Sender<Reply>,
}

/// In-flight requests keyed by JSON-RPC id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: u64, method: impl Into<String>) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let method = method.into();
        self.lock().insert(
            id,
            Waiter {
                method: method.clone(),
                tx,
            },
        );
        PendingReply { id, method, rx }
    }

    /// Forget a request whose send failed.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Deliver a response. Returns false when nothing was waiting on `id`.
    pub fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) -> bool {
        let Some(waiter) = self.lock().remove(&id) else {
            return false;
        };
        if waiter.tx.send(outcome.map_err(GatewayError::from)).is_err() {
            debug!(id, method = %waiter.method, "response arrived after caller gave up");
        }
        true
    }

    /// Fail every in-flight request, used when the connection drops.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Waiter> = self.lock().drain().map(|(_, w)| w).collect();
        let n = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(GatewayError::NotConnected));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half of a registered request.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> Reply {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(GatewayError::NotConnected),
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let pending = PendingRequests::new();
        let reply = pending.register(1, "public/test");
        assert!(pending.resolve(1, Ok(json!({"version": "1.2.26"}))));
        let v = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(v["version"], "1.2.26");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_delivers_rpc_error() {
        let pending = PendingRequests::new();
        let reply = pending.register(2, "private/subscribe");
        pending.resolve(
            2,
            Err(RpcError {
                code: 13009,
                message: "unauthorized".into(),
                data: None,
            }),
        );
        match reply.wait(Duration::from_secs(1)).await {
            Err(GatewayError::Rpc { code, .. }) => assert_eq!(code, 13009),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve(99, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let pending = PendingRequests::new();
        let reply = pending.register(3, "public/test");
        let err = reply.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingRequests::new();
        let a = pending.register(1, "a");
        let b = pending.register(2, "b");
        assert_eq!(pending.fail_all(), 2);
        assert!(matches!(a.wait(Duration::from_secs(1)).await, Err(GatewayError::NotConnected)));
        assert!(matches!(b.wait(Duration::from_secs(1)).await, Err(GatewayError::NotConnected)));
    }
}
