//! Test doubles for the gateway seams.
//!
//! `MockGateway` answers `call` from a per-method table and records every
//! call. `MockTransport` stands in for the stream when testing subscription
//! bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::gateway::{Gateway, StreamTransport};
use crate::pending::{PendingReply, PendingRequests};

/// Configurable response for one method.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Ok(Value),
    /// Return Err(Rpc).
    RpcError(i64, String),
    /// Return Err(Transport).
    TransportError(String),
    /// Sleep, then return Ok.
    Delayed(Duration, Value),
}

#[derive(Default)]
pub struct MockGateway {
    responses: Mutex<HashMap<String, MockResponse>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), response);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.calls.lock().unwrap().push((method.to_string(), params));
        let response = self.responses.lock().unwrap().get(method).cloned();
        match response {
            Some(MockResponse::Ok(v)) => Ok(v),
            Some(MockResponse::RpcError(code, message)) => Err(GatewayError::Rpc { code, message }),
            Some(MockResponse::TransportError(e)) => Err(GatewayError::Transport(e)),
            Some(MockResponse::Delayed(delay, v)) => {
                tokio::time::sleep(delay).await;
                Ok(v)
            }
            None => Err(GatewayError::Rpc {
                code: -32601,
                message: format!("method not found: {}", method),
            }),
        }
    }
}

/// Stream stand-in that records requests instead of writing them.
pub struct MockTransport {
    connected: AtomicBool,
    fail_sends: AtomicBool,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            fail_sends: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingRequests::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn pending(&self) -> Arc<PendingRequests> {
        Arc::clone(&self.pending)
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<PendingReply, GatewayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("send failed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push((method.to_string(), params));
        Ok(self.pending.register(id, method))
    }
}

/// Deribit-shaped order JSON.
pub fn order_json(order_id: &str, state: &str) -> Value {
    json!({
        "order_id": order_id,
        "instrument_name": "BTC-PERPETUAL",
        "order_type": "limit",
        "direction": "buy",
        "price": 50000.0,
        "amount": 10.0,
        "filled_amount": 0.0,
        "time_in_force": "good_til_cancelled",
        "order_state": state,
        "creation_timestamp": 1_700_000_000_000i64,
        "last_update_timestamp": 1_700_000_000_000i64
    })
}

/// Deribit-shaped `public/get_order_book` result.
pub fn order_book_json(instrument: &str, timestamp: i64) -> Value {
    json!({
        "instrument_name": instrument,
        "timestamp": timestamp,
        "change_id": timestamp,
        "bids": [[50000.0, 10.0], [49999.5, 20.0]],
        "asks": [[50000.5, 5.0]],
        "state": "open"
    })
}

/// Deribit-shaped position JSON.
pub fn position_json(instrument: &str, size: f64) -> Value {
    json!({
        "instrument_name": instrument,
        "size": size,
        "average_price": 50000.0,
        "mark_price": 50010.0,
        "estimated_liquidation_price": null,
        "floating_profit_loss": 0.0002,
        "realized_profit_loss": 0.0,
        "total_profit_loss": 0.0002,
        "kind": "future",
        "direction": "buy"
    })
}
