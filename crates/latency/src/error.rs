use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatencyError {
    #[error("failed to export latency metrics to {path}: {source}")]
    Export {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
