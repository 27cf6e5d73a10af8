//! JSON-RPC 2.0 framing for the Deribit API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Error object of a failed JSON-RPC call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<RpcError> for GatewayError {
    fn from(e: RpcError) -> Self {
        GatewayError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    /// Periodic keepalive, no reply needed.
    Heartbeat,
    /// Server asks for a `public/test` reply.
    TestRequest,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Subscription { channel: String, data: Value },
    Response { id: u64, outcome: Result<Value, RpcError> },
    Heartbeat(HeartbeatKind),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct SubscriptionParams {
    channel: String,
    data: Value,
}

#[derive(Deserialize)]
struct HeartbeatParams {
    #[serde(rename = "type")]
    kind: String,
}

/// Classify a raw text frame. Anything that is not a subscription
/// notification, a response or a heartbeat is a protocol error.
pub fn classify(raw: &str) -> Result<Inbound, GatewayError> {
    let frame: RawFrame = serde_json::from_str(raw)
        .map_err(|e| GatewayError::Protocol(format!("invalid json: {}", e)))?;

    match frame.method.as_deref() {
        Some("subscription") => {
            let params = frame
                .params
                .ok_or_else(|| GatewayError::Protocol("subscription without params".into()))?;
            let params: SubscriptionParams = serde_json::from_value(params)
                .map_err(|e| GatewayError::Protocol(format!("bad subscription params: {}", e)))?;
            Ok(Inbound::Subscription {
                channel: params.channel,
                data: params.data,
            })
        }
        Some("heartbeat") => {
            let params: HeartbeatParams = frame
                .params
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| GatewayError::Protocol(format!("bad heartbeat params: {}", e)))?
                .ok_or_else(|| GatewayError::Protocol("heartbeat without params".into()))?;
            Ok(Inbound::Heartbeat(match params.kind.as_str() {
                "test_request" => HeartbeatKind::TestRequest,
                _ => HeartbeatKind::Heartbeat,
            }))
        }
        Some(other) => Err(GatewayError::Protocol(format!("unexpected method: {}", other))),
        None => {
            let id = frame
                .id
                .ok_or_else(|| GatewayError::Protocol("frame has neither method nor id".into()))?;
            let outcome = match frame.error {
                Some(err) => Err(err),
                None => Ok(frame.result),
            };
            Ok(Inbound::Response { id, outcome })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_subscription() {
        let raw = r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.none.10.100ms","data":{"a":1}}}"#;
        assert_eq!(
            classify(raw).unwrap(),
            Inbound::Subscription {
                channel: "book.BTC-PERPETUAL.none.10.100ms".into(),
                data: json!({"a": 1}),
            }
        );
    }

    #[test]
    fn test_classify_result_and_error() {
        let ok = r#"{"jsonrpc":"2.0","id":7,"result":["book.BTC-PERPETUAL.none.10.100ms"],"usIn":1,"usOut":2}"#;
        assert_eq!(
            classify(ok).unwrap(),
            Inbound::Response {
                id: 7,
                outcome: Ok(json!(["book.BTC-PERPETUAL.none.10.100ms"])),
            }
        );

        let err = r#"{"jsonrpc":"2.0","id":8,"error":{"code":13009,"message":"unauthorized"}}"#;
        match classify(err).unwrap() {
            Inbound::Response { id, outcome: Err(e) } => {
                assert_eq!(id, 8);
                assert_eq!(e.code, 13009);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_heartbeats() {
        let hb = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"heartbeat"}}"#;
        assert_eq!(classify(hb).unwrap(), Inbound::Heartbeat(HeartbeatKind::Heartbeat));
        let tr = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#;
        assert_eq!(classify(tr).unwrap(), Inbound::Heartbeat(HeartbeatKind::TestRequest));
    }

    #[test]
    fn test_classify_malformed() {
        for raw in [
            "not json",
            "[1,2,3]",
            r#"{"jsonrpc":"2.0"}"#,
            r#"{"method":"subscription"}"#,
            r#"{"method":"subscription","params":{"channel":1}}"#,
            r#"{"method":"something_else","params":{}}"#,
        ] {
            assert!(
                matches!(classify(raw), Err(GatewayError::Protocol(_))),
                "{} should be a protocol error",
                raw
            );
        }
    }

    #[test]
    fn test_request_serializes() {
        let params = json!({"channels": ["x"]});
        let req = RpcRequest::new(3, "public/subscribe", &params);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 3);
        assert_eq!(v["params"]["channels"][0], "x");
    }
}
