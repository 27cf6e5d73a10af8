use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
