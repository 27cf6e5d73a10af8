use thiserror::Error;

use relay_distribution::DistributionError;
use relay_gateway::GatewayError;
use relay_latency::LatencyError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Latency(#[from] LatencyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
