use thiserror::Error;

use relay_gateway::GatewayError;

/// Errors from cache reads and order entry
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("upstream request failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("invalid order request: {0}")]
    InvalidRequest(String),
}
