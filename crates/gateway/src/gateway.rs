use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::pending::PendingReply;

/// Request/response surface of the exchange.
///
/// Implementations handle transport and authentication; callers see a JSON
/// result or a typed error.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError>;

    /// `call` bounded by `timeout`. The in-flight request is dropped on expiry.
    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        match tokio::time::timeout(timeout, self.call(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Upstream connection state as published by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Streaming side of the exchange: fire requests, answers arrive later
/// through the dispatcher.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write a request to the socket and register it for correlation.
    /// Returns once the frame is handed to the writer, not when answered.
    async fn send_request(&self, method: &str, params: Value) -> Result<PendingReply, GatewayError>;
}
