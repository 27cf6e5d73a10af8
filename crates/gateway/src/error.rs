use thiserror::Error;

use relay_model::ModelError;

/// Errors from the upstream gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("upstream not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] ModelError),
}

impl GatewayError {
    /// Whether the failure happened before a response was received.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::NotConnected | GatewayError::Transport(_) | GatewayError::Timeout { .. }
        )
    }
}
